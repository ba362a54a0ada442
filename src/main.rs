fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if handle_info_flags(&args) {
        return;
    }

    let options = match blogview::RunOptions::parse(args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err}\n\nRun with --help for usage.");
            std::process::exit(2);
        }
    };

    if let Err(err) = blogview::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_info_flags(args: &[String]) -> bool {
    let mut saw_flag = false;
    for arg in args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("blogview {}", blogview::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "blogview - Browse a Tumblr blog, its likes or your dashboard from the terminal.\n\n  --blog,    -b NAME    Blog to view (default: your own)\n  --mode,    -m MODE    posts, likes or dashboard (default: posts)\n  --pages,   -p N       Pages to load (default: 1)\n  --config,  -c PATH    Config file (default: ~/.config/blogview/config.yaml)\n  --offline            Browse a built-in sample blog\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message"
                );
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
