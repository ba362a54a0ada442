use assert_cmd::Command;
use predicates::prelude::*;

fn blogview() -> Command {
    let mut cmd = Command::cargo_bin("blogview").unwrap();
    cmd.env("RUST_LOG", "off")
        .args(["--config", "/nonexistent/blogview/config.yaml"]);
    cmd
}

#[test]
fn prints_version() {
    blogview()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    blogview()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--offline").and(predicate::str::contains("--version")));
}

#[test]
fn rejects_unknown_argument() {
    blogview()
        .arg("--sideways")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown argument"));
}

#[test]
fn missing_credentials_are_fatal() {
    blogview()
        .env_remove("BLOGVIEW_API__CONSUMER_KEY")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("api.consumer_key is required"));
}

#[test]
fn offline_browses_sample_blog() {
    blogview()
        .args(["--offline", "--pages", "2"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Posts for demo")
                .and(predicate::str::contains("page 0: 6 posts, 4 photos"))
                .and(predicate::str::contains("page 1: 0 posts, 0 photos"))
                .and(predicate::str::contains("demo/1#0"))
                .and(predicate::str::contains("follow-state: your blog"))
                .and(predicate::str::contains("current-user: signed in as demo (avatar)"))
                .and(predicate::str::contains("following-menu: 2 blogs [staff, photography]")),
        );
}

#[test]
fn offline_dashboard_mixes_blogs() {
    blogview()
        .args(["--offline", "--mode", "dashboard"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Dashboard for demo")
                .and(predicate::str::contains("staff/101#0"))
                .and(predicate::str::contains("photography/102#0")),
        );
}

#[test]
fn offline_unknown_blog_is_reported() {
    blogview()
        .args(["--offline", "--blog", "nobody"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no blog named"));
}
