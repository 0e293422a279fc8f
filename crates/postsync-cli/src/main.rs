//! postsync: command-line client for a posts server
//!
//! Subcommands:
//! - `list`: all posts, newest first
//! - `show`: one post by id
//! - `by-user`: posts of one author
//! - `add`, `edit`, `delete`: write posts
//! - `react`: add a reaction to a post

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use postsync::{
    DEFAULT_KEEP_UNUSED_SECS, MemoryRemote, MutationOutput, NewPost, Post, PostId, PostUpdate,
    QuerySubscription, RawPost, ReactionKind, Reactions, RemoteSource, SyncClient, SyncConfig,
    UserId,
};
use postsync_http::{HttpRemote, HttpRemoteConfig};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "postsync")]
#[command(about = "Read and write posts through a synced client cache", long_about = None)]
struct Cli {
    /// Posts server URL
    #[arg(long, env = "POSTSYNC_BASE_URL", default_value = "http://localhost:3500", global = true)]
    base_url: String,

    /// Use a seeded in-memory server instead of HTTP
    #[arg(
        long,
        env = "POSTSYNC_IN_MEMORY",
        value_parser = parse_bool_env,
        action = clap::ArgAction::Set,
        default_value = "false",
        global = true
    )]
    in_memory: bool,

    /// Seconds an unused query stays cached
    #[arg(long, env = "POSTSYNC_KEEP_UNUSED_SECS", default_value_t = DEFAULT_KEEP_UNUSED_SECS, global = true)]
    keep_unused_secs: u64,

    /// Retries for transient HTTP failures
    #[arg(long, default_value = "3", global = true)]
    max_retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// List all posts, newest first
    List,

    /// Show one post
    Show {
        /// Post id
        id: String,
    },

    /// List the posts of one author
    ByUser {
        /// Author id
        user_id: u64,
    },

    /// Create a post
    Add {
        #[arg(long)]
        title: String,

        #[arg(long)]
        body: String,

        /// Author id
        #[arg(long)]
        user: u64,
    },

    /// Replace a post's title, body and author
    Edit {
        /// Post id
        id: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        body: String,

        /// Author id
        #[arg(long)]
        user: u64,
    },

    /// Delete a post
    Delete {
        /// Post id
        id: String,
    },

    /// Add one reaction to a post (thumbsUp, wow, heart, rocket, coffee)
    React {
        /// Post id
        id: String,

        /// Reaction name
        kind: ReactionKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "postsync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let remote: Arc<dyn RemoteSource> = if cli.in_memory {
        info!("using in-memory posts server");
        Arc::new(MemoryRemote::with_posts(seed_posts()))
    } else {
        let config = HttpRemoteConfig::new(&cli.base_url)
            .with_retries(cli.max_retries, Duration::from_millis(500));
        Arc::new(HttpRemote::new(config).into_diagnostic()?)
    };

    let config = SyncConfig::builder()
        .keep_unused_for(Duration::from_secs(cli.keep_unused_secs))
        .build();
    let client = SyncClient::start(remote, config).await.into_diagnostic()?;

    let result = run(&client, cli.command).await;
    client.shutdown().await;
    result
}

async fn run(client: &SyncClient, command: Commands) -> Result<()> {
    match command {
        Commands::List => print_json(&load(client.posts()).await?),

        Commands::Show { id } => {
            load(client.posts()).await?;
            let post = client
                .select_post_by_id(&PostId::new(id.as_str()))
                .ok_or_else(|| miette!("post {} not found", id))?;
            print_json(&post)
        }

        Commands::ByUser { user_id } => print_json(&load(client.posts_by_user(UserId(user_id))).await?),

        Commands::Add { title, body, user } => {
            let output = client
                .add_new_post(NewPost::new(title, body, UserId(user)))
                .await
                .into_diagnostic()?;
            print_output(&output)
        }

        Commands::Edit {
            id,
            title,
            body,
            user,
        } => {
            let update = PostUpdate {
                id: PostId::new(id),
                title,
                body,
                user_id: Some(UserId(user)),
            };
            let output = client.update_post(update).await.into_diagnostic()?;
            print_output(&output)
        }

        Commands::Delete { id } => {
            let output = client.delete_post(PostId::new(id)).await.into_diagnostic()?;
            print_output(&output)
        }

        Commands::React { id, kind } => {
            // Counts are incremented from the cached list.
            load(client.posts()).await?;
            let output = client.react(PostId::new(id), kind).await.into_diagnostic()?;
            print_output(&output)
        }
    }
}

/// Wait for a query's first fetch to settle and return its posts.
async fn load(mut subscription: QuerySubscription) -> Result<Vec<Post>> {
    let state = subscription.wait_settled().await.into_diagnostic()?;
    if let Some(err) = state.error.clone() {
        if state.data.is_none() {
            return Err(err).into_diagnostic();
        }
        warn!(error = %err, "refetch failed, showing cached posts");
    }
    Ok(state.posts())
}

fn print_output(output: &MutationOutput) -> Result<()> {
    match output {
        MutationOutput::Deleted(id) => {
            info!(%id, "deleted post");
            Ok(())
        }
        other => match other.post() {
            Some(post) => print_json(post),
            None => Ok(()),
        },
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{json}");
    Ok(())
}

/// Posts served by `--in-memory`.
fn seed_posts() -> Vec<RawPost> {
    let posts = [
        (1, "First Post!", "Hello from the first post.", 0, 10),
        (2, "Second Post", "More text to read.", 1, 5),
        (3, "Third Post", "Reactions welcome.", 2, 0),
    ];
    posts
        .into_iter()
        .map(|(id, title, body, user, minutes_ago)| RawPost {
            id: PostId::from(id),
            title: title.to_string(),
            body: body.to_string(),
            user_id: Some(UserId(user)),
            date: Utc
                .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
                .single()
                .map(|noon| noon - chrono::Duration::minutes(minutes_ago)),
            reactions: Some(Reactions::default()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("Yes"), Ok(true));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_parse_react() {
        let cli = Cli::try_parse_from(["postsync", "--in-memory", "1", "react", "2", "rocket"]).unwrap();
        assert!(cli.in_memory);
        assert_eq!(
            cli.command,
            Commands::React {
                id: "2".to_string(),
                kind: ReactionKind::Rocket,
            }
        );
    }

    #[test]
    fn test_in_memory_defaults_off() {
        let cli = Cli::try_parse_from(["postsync", "list"]).unwrap();
        assert!(!cli.in_memory);
        assert_eq!(cli.command, Commands::List);

        let cli = Cli::try_parse_from(["postsync", "list", "--in-memory", "off"]).unwrap();
        assert!(!cli.in_memory);
    }

    #[test]
    fn test_parse_rejects_unknown_reaction() {
        assert!(Cli::try_parse_from(["postsync", "react", "2", "confetti"]).is_err());
    }

    #[tokio::test]
    async fn test_react_against_seeded_posts() {
        let remote = Arc::new(MemoryRemote::with_posts(seed_posts()));
        let client = SyncClient::start(remote.clone(), SyncConfig::default())
            .await
            .unwrap();

        let posts = load(client.posts()).await.unwrap();
        assert_eq!(posts[0].title, "Third Post");

        run(
            &client,
            Commands::React {
                id: "1".to_string(),
                kind: ReactionKind::Coffee,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            client.select_post_by_id(&PostId::from(1)).unwrap().reactions.coffee,
            1
        );
        client.shutdown().await;
    }
}
