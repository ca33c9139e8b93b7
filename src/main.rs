use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use robot_brain::brain::{self, Chain, MessageMeta, SpeakLimits, Speech};
use robot_brain::core::config::{AppPaths, Config, ConfigService, LogFormat};
use robot_brain::core::errors::BrainError;
use robot_brain::core::logging;
use robot_brain::userhash::{UserHash, UserHasher};

/// Markov chain chat brain.
#[derive(Parser)]
#[command(name = "robot", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, global = true, env = "ROBOT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Log level or filter directive, overriding the config.
    #[arg(long, global = true)]
    log: Option<String>,

    /// Log output format.
    #[arg(long, global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,

    /// Also write logs under the data directory when no log dir is configured.
    #[arg(long, global = true)]
    log_to_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate messages from a tag.
    #[command(visible_aliases = ["talk", "generate", "say"])]
    Speak(SpeakArgs),

    /// Learn each line of stdin as one message.
    Learn(LearnArgs),

    /// Forget each line of stdin once.
    Forget {
        #[arg(long)]
        tag: String,
    },

    /// Forget everything learned from one message.
    ForgetMessage {
        #[arg(long)]
        tag: String,
        #[arg(long)]
        id: Uuid,
    },

    /// Forget everything learned from one user in one room.
    ForgetUser {
        #[arg(long)]
        room: String,
        #[arg(long)]
        user: String,
    },
}

#[derive(Args)]
struct SpeakArgs {
    #[arg(long)]
    tag: String,

    /// Number of messages to generate.
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,

    /// Text the generated messages continue from.
    #[arg(long)]
    prompt: Option<String>,

    /// Print the IDs of the messages each output was sampled from.
    #[arg(long)]
    trace: bool,

    /// Print one JSON object per message.
    #[arg(long, conflicts_with = "trace")]
    json: bool,
}

#[derive(Args)]
struct LearnArgs {
    #[arg(long)]
    tag: String,

    /// Room the messages were sent in.
    #[arg(long, requires = "user")]
    room: Option<String>,

    /// Sender of the messages.
    #[arg(long, requires = "room")]
    user: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = Arc::new(AppPaths::new());
    let service = ConfigService::new(paths.clone());
    let mut config = service
        .load_config(cli.config.as_deref())
        .context("Failed to load config")?;
    if let Some(level) = &cli.log {
        config.log.level = level.clone();
    }
    if let Some(format) = cli.log_format.as_deref() {
        config.log.format = match format {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }
    if cli.log_to_file && config.log.dir.is_none() {
        config.log.dir = Some(paths.log_dir.clone());
    }
    logging::init(&config.log);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, canceling");
            on_signal.cancel();
        }
    });

    let brain = brain::open(&config.brain)
        .await
        .context("Failed to open brain")?;
    let chain = Chain::new(
        brain,
        Arc::new(config.brain.canon),
        SpeakLimits::from(config.speak),
    );

    let res = match cli.command {
        Command::Speak(args) => speak(&chain, &cancel, args).await,
        Command::Learn(args) => learn(&chain, &cancel, &config, args).await,
        Command::Forget { tag } => forget(&chain, &cancel, &tag).await,
        Command::ForgetMessage { tag, id } => chain
            .forget_message(&cancel, &tag, id)
            .await
            .map(report)
            .map_err(Into::into),
        Command::ForgetUser { room, user } => match hasher(&config) {
            Ok(hasher) => chain
                .forget_user(&cancel, &hasher.hash(&room, &user))
                .await
                .map(report)
                .map_err(Into::into),
            Err(err) => Err(err),
        },
    };
    if let Err(err) = chain.flush().await {
        tracing::warn!("Failed to flush brain: {}", err);
    }
    if let Err(err) = &res {
        match err.downcast_ref::<BrainError>() {
            Some(BrainError::Canceled) => tracing::info!("Canceled"),
            Some(err) => tracing::warn!("{}", err),
            None => {}
        }
    }
    res
}

async fn speak(chain: &Chain, cancel: &CancellationToken, args: SpeakArgs) -> anyhow::Result<()> {
    let prompt: Arc<Vec<String>> = Arc::new(
        args.prompt
            .as_deref()
            .map(tokenize)
            .unwrap_or_default(),
    );
    let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
    let permits = Arc::new(Semaphore::new(workers));
    let tag: Arc<str> = Arc::from(args.tag);

    let mut tasks = JoinSet::new();
    for _ in 0..args.count {
        let permit = permits.clone().acquire_owned().await?;
        let (chain, cancel, tag, prompt) = (chain.clone(), cancel.clone(), tag.clone(), prompt.clone());
        tasks.spawn(async move {
            let _permit = permit;
            chain.speak(&cancel, &tag, prompt.as_slice()).await
        });
        // Print whatever has finished while more walks wait for a permit.
        while let Some(done) = tasks.try_join_next() {
            print_speech(done??, args.trace, args.json)?;
        }
    }
    while let Some(done) = tasks.join_next().await {
        print_speech(done??, args.trace, args.json)?;
    }
    Ok(())
}

fn print_speech(speech: Option<Speech>, trace: bool, json: bool) -> anyhow::Result<()> {
    let Some(speech) = speech else {
        tracing::debug!("Nothing to say");
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string(&speech)?);
    } else if trace {
        let ids: Vec<String> = speech.trace.iter().map(Uuid::to_string).collect();
        println!("{}\t{}", speech.text, ids.join(","));
    } else {
        println!("{}", speech.text);
    }
    Ok(())
}

async fn learn(
    chain: &Chain,
    cancel: &CancellationToken,
    config: &Config,
    args: LearnArgs,
) -> anyhow::Result<()> {
    let user = match (&args.room, &args.user) {
        (Some(room), Some(user)) => hasher(config)?.hash(room, user),
        _ => UserHash::default(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut n = 0;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let toks = tokenize(&line);
        if toks.is_empty() {
            continue;
        }
        let meta = MessageMeta {
            id: Uuid::new_v4(),
            user,
            tag: args.tag.clone(),
            time: Utc::now(),
        };
        chain.learn(cancel, &meta, &toks).await?;
        n += 1;
    }
    tracing::info!("Learned {} messages into {:?}", n, args.tag);
    Ok(())
}

async fn forget(chain: &Chain, cancel: &CancellationToken, tag: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut n = 0;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let toks = tokenize(&line);
        if toks.is_empty() {
            continue;
        }
        chain.forget(cancel, tag, &toks).await?;
        n += 1;
    }
    tracing::info!("Forgot {} messages from {:?}", n, tag);
    Ok(())
}

fn report(removed: usize) {
    println!("forgot {removed} occurrences");
}

fn hasher(config: &Config) -> anyhow::Result<UserHasher> {
    let path = config
        .secret
        .as_deref()
        .context("A secret file is required to hash users; set `secret` in the config")?;
    Ok(UserHasher::from_file(path)?)
}

fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_speak_with_alias_and_globals() {
        let cli = Cli::try_parse_from([
            "robot", "say", "--tag", "chan", "-n", "3", "--prompt", "good morning", "--log", "debug",
        ])
        .unwrap();
        assert_eq!(cli.log.as_deref(), Some("debug"));
        match cli.command {
            Command::Speak(args) => {
                assert_eq!(args.tag, "chan");
                assert_eq!(args.count, 3);
                assert_eq!(args.prompt.as_deref(), Some("good morning"));
            }
            _ => panic!("expected speak"),
        }
    }

    #[test]
    fn learn_requires_room_and_user_together() {
        assert!(Cli::try_parse_from(["robot", "learn", "--tag", "x", "--room", "r"]).is_err());
        assert!(Cli::try_parse_from(["robot", "learn", "--tag", "x", "--room", "r", "--user", "u"]).is_ok());
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["robot", "--log-format", "xml", "forget", "--tag", "x"]).is_err());
    }

    #[test]
    fn tokenize_splits_on_whitespace() {
        assert_eq!(tokenize("  hello \t world  "), vec!["hello", "world"]);
        assert!(tokenize("   ").is_empty());
    }
}
