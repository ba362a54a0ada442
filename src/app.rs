use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use log::{info, warn};

use crate::config;
use crate::data::{self, MockRemote, RemoteFeed};
use crate::engine::Engine;
use crate::oauth;
use crate::refresh::{Field, FieldValue};
use crate::resolve::{Avatar, FollowState};
use crate::session::DisplayMode;
use crate::sink::{ChannelSink, Preview, SinkEvent};
use crate::task::AsyncResult;
use crate::tumblr;

const FIELD_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub blog: Option<String>,
    pub mode: DisplayMode,
    pub pages: u32,
    pub config_file: Option<PathBuf>,
    pub offline: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            blog: None,
            mode: DisplayMode::Posts,
            pages: 1,
            config_file: None,
            offline: false,
        }
    }
}

impl RunOptions {
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .with_context(|| format!("cli: {flag} needs a value"))
            };
            match arg.as_str() {
                "--blog" | "-b" => options.blog = Some(value("--blog")?),
                "--mode" | "-m" => options.mode = value("--mode")?.parse()?,
                "--pages" | "-p" => {
                    let raw = value("--pages")?;
                    options.pages = raw
                        .parse()
                        .with_context(|| format!("cli: --pages expects a number, got {raw:?}"))?;
                }
                "--config" | "-c" => options.config_file = Some(PathBuf::from(value("--config")?)),
                "--offline" => options.offline = true,
                other => bail!("cli: unknown argument {other:?}"),
            }
        }
        Ok(options)
    }
}

pub fn run(options: RunOptions) -> Result<()> {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("blogview=info"),
    )
    .try_init();

    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;

    let remote: Arc<dyn RemoteFeed> = if options.offline {
        info!("app: browsing the built-in sample blog");
        Arc::new(demo_remote()?)
    } else {
        cfg.api.validate()?;
        Arc::new(tumblr::Client::new(tumblr::ClientConfig {
            credentials: oauth::Credentials {
                consumer_key: cfg.api.consumer_key.clone(),
                consumer_secret: cfg.api.consumer_secret.clone(),
                token: cfg.api.oauth_token.clone(),
                token_secret: cfg.api.oauth_token_secret.clone(),
            },
            base_url: Some(cfg.api.base_url.clone()),
            user_agent: cfg.api.user_agent.clone(),
            timeout: cfg.api.timeout,
            avatar_timeout: cfg.viewer.avatar_timeout,
            http_client: None,
        })?)
    };

    let (sink, events) = ChannelSink::channel();
    let engine = Engine::connect(remote, Arc::new(sink), cfg.engine_options())?;

    if let Some(blog) = options.blog.as_deref() {
        if options.mode != DisplayMode::Dashboard && !engine.blog_exists(blog) {
            bail!("app: no blog named {blog:?}");
        }
    }

    let session = engine.open_session(options.mode, options.blog.as_deref());
    println!("{}", session.title());

    for _ in 0..options.pages {
        if let Some(handle) = engine.load_more(&session).handle() {
            if let AsyncResult::Failed(reason) = handle.wait() {
                warn!("app: load more failed: {reason}");
            }
        }
        print_events(&events);
    }

    engine.refresh_session(&session);
    let mut remaining = Field::SESSION.len();
    while remaining > 0 {
        match events.recv_timeout(FIELD_WAIT) {
            Ok(event) => {
                if matches!(event, SinkEvent::Field(_)) {
                    remaining -= 1;
                }
                print_event(event);
            }
            Err(_) => {
                warn!("app: gave up waiting for {remaining} fields");
                break;
            }
        }
    }

    engine.close_session(session.id());
    Ok(())
}

fn print_events(events: &Receiver<SinkEvent>) {
    for event in events.try_iter() {
        print_event(event);
    }
}

fn print_event(event: SinkEvent) {
    match event {
        SinkEvent::Item { item, .. } => {
            let image = item.image();
            println!("  {}  {}x{}  {}", item.key(), image.width, image.height, image.url);
        }
        SinkEvent::Page { summary, .. } => match summary.failure {
            Some(reason) => println!("page {}: failed ({reason})", summary.page_index),
            None => println!(
                "page {}: {} posts, {} photos",
                summary.page_index, summary.fetched, summary.delivered
            ),
        },
        SinkEvent::Field(update) => {
            let shown = match &update.result {
                AsyncResult::Success(value) => describe(value),
                AsyncResult::Failed(reason) => format!("unavailable ({reason})"),
                AsyncResult::Cancelled => "cancelled".to_string(),
            };
            println!("{}: {shown}", update.field.name());
        }
        SinkEvent::Action { action, result, .. } => println!("{action}: {result:?}"),
        SinkEvent::Preview { element, preview } => match preview {
            Preview::Title { blog, title } => println!("{element}: {blog} {title:?}"),
            other => println!("{element}: avatar for {}", other.blog()),
        },
    }
}

fn describe(value: &FieldValue) -> String {
    match value {
        FieldValue::LikeState(liked) => (if *liked { "liked" } else { "not liked" }).to_string(),
        FieldValue::Notes(info) => info.count_label(),
        FieldValue::ReblogSource(source) => match source {
            Some(source) => format!("reblogged from {}", source.blog),
            None => "original post".to_string(),
        },
        FieldValue::FollowState(state) => {
            let shown = match state {
                FollowState::OwnBlog => "your blog",
                FollowState::Following => "following",
                FollowState::NotFollowing => "not following",
            };
            shown.to_string()
        }
        FieldValue::FollowingMenu(menu) | FieldValue::FollowersMenu(menu) => {
            let names: Vec<&str> = menu.links.iter().map(|link| link.blog.as_str()).collect();
            let mut shown = format!("{} blogs [{}]", menu.total, names.join(", "));
            if let Some(more) = menu.overflow_label() {
                shown.push_str(&format!(" {more}"));
            }
            shown
        }
        FieldValue::ModeMenu(menu) => {
            let likes = match menu.likes_total {
                Some(count) if menu.can_view_likes => format!("{count} likes"),
                _ => "likes hidden".to_string(),
            };
            format!("{}: {} posts, {likes}", menu.blog, menu.posts_total)
        }
        FieldValue::CurrentUser(user) => {
            let avatar = match &user.avatar {
                Avatar::Image(_) => "avatar",
                Avatar::Placeholder { .. } => "no avatar",
            };
            format!("signed in as {} ({avatar})", user.name)
        }
    }
}

pub fn demo_remote() -> Result<MockRemote> {
    let posts = (1..=6)
        .map(|id| {
            if id % 3 == 0 {
                data::mock_text_post("demo", id)
            } else {
                data::mock_photo_post("demo", id, &[1280, 500, 250])
            }
        })
        .collect();
    let dashboard = vec![
        data::mock_photo_post("staff", 101, &[1280, 500]),
        data::mock_photo_post("photography", 102, &[640, 500]),
        data::mock_text_post("staff", 103),
    ];
    Ok(MockRemote::new("demo")
        .with_blog("demo", "Demo blog")
        .with_posts("demo", posts)
        .with_likes("demo", vec![data::mock_photo_post("staff", 101, &[1280, 500])])
        .with_dashboard(dashboard)
        .with_blog("staff", "Staff")
        .with_posts("staff", vec![data::mock_photo_post("staff", 101, &[1280, 500])])
        .with_following(&["staff", "photography"])
        .with_followers(&["staff"])
        .with_avatar("demo", data::solid_png(64)?))
}
