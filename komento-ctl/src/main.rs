use std::sync::Arc;

use anyhow::Context;
use komento_client::{
    api::{AuthToken, AuthorRef, CommentId, NewComment, ThreadId, UserId, Uuid},
    CommentView, HttpThreadApi, NoTransport, SyncConfig, SyncHandle, ThreadApi, ThreadView,
};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long)]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Post a comment
    Post {
        /// Thread to post into
        thread: Uuid,

        /// Comment content
        content: String,

        /// Reply under this comment instead of at the top level
        #[structopt(short, long)]
        parent: Option<Uuid>,
    },

    /// Print a thread's counters
    Stats {
        /// Thread to inspect
        thread: Uuid,
    },

    /// Follow a thread, reprinting it on every change
    Tail {
        /// Thread to follow
        thread: Uuid,
    },
}

fn token() -> anyhow::Result<AuthToken> {
    let tok = std::env::var("KOMENTO_TOKEN")
        .context("retrieving KOMENTO_TOKEN environment variable")?;
    let tok = Uuid::try_parse(&tok).context("parsing KOMENTO_TOKEN as an auth token")?;
    Ok(AuthToken(tok))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opt = <Opt as structopt::StructOpt>::from_args();

    let api = HttpThreadApi::new(&opt.host, token()?);

    match opt.cmd {
        Command::Post {
            thread,
            content,
            parent,
        } => {
            let posted = api
                .create_comment(
                    ThreadId(thread),
                    NewComment::new(content, parent.map(CommentId)),
                )
                .await?;
            println!("{}", posted.id.0);
        }
        Command::Stats { thread } => {
            let stats = api.fetch_stats(ThreadId(thread)).await?;
            println!("comments: {}", stats.total_comments);
            println!("replies:  {}", stats.total_replies);
            println!("likes:    {}", stats.total_likes);
        }
        Command::Tail { thread } => {
            // no feed transport here, the engine runs on polling alone
            let handle = SyncHandle::spawn(
                SyncConfig::default(),
                ThreadId(thread),
                AuthorRef::new(UserId(Uuid::new_v4()), "komento-ctl"),
                Arc::new(api),
                Arc::new(NoTransport),
            );
            let mut views = handle.views();
            print_thread(&handle.view());
            loop {
                views.changed().await.context("sync engine stopped")?;
                let view = views.borrow_and_update().clone();
                print_thread(&view);
            }
        }
    }

    Ok(())
}

fn print_thread(view: &ThreadView) {
    println!(
        "== {} comments, {} replies, {} likes",
        view.stats.total_comments, view.stats.total_replies, view.stats.total_likes
    );
    for comment in &view.comments {
        print_comment(comment, 0);
    }
    println!();
}

fn print_comment(comment: &CommentView, depth: usize) {
    let indent = "  ".repeat(depth);
    let edited = if comment.is_edited { " (edited)" } else { "" };
    let pending = if comment.is_optimistic { " [sending]" } else { "" };
    println!(
        "{indent}{} at {}{edited}{pending}: {}",
        comment.author.display_name,
        comment.created_at.format("%Y-%m-%d %H:%M:%S"),
        comment.content
    );
    if !comment.liked_by.is_empty() {
        println!("{indent}  {} likes", comment.liked_by.len());
    }
    for reply in &comment.replies {
        print_comment(reply, depth + 1);
    }
}
