use anyhow::Context as _;
use camino::Utf8Path;
use clap::Parser;
use gscp::{
    auth::{AuthorizationRequired, Authenticator, TokenCache},
    config::Config,
    gcs::Gcs,
    remote::is_remote,
    store::{self, Storage, Store},
};
use nu_ansi_term::{Color, Style};
use std::io::Write;

/// Copies files to and from Google Cloud Storage.
///
///   gscp project@bucket:object file
///   gscp file project@bucket:object
///   gscp project@bucket
///   gscp project
#[derive(Parser)]
#[clap(author, version, about, verbatim_doc_comment)]
struct Args {
    #[clap(flatten)]
    config: Config,
    /// Makes an uploaded object readable by anyone
    #[arg(long)]
    public: bool,
    /// Increases log verbosity, can be repeated
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// `<source> <destination>` to copy, or a `project@bucket` or `project`
    /// to list
    #[arg(num_args = 1..=2, required = true)]
    paths: Vec<String>,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn,gscp=info",
        1 => "info,gscp=debug",
        _ => "debug",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn bytes_to_human(bytes: u64) -> String {
    use number_prefix::NumberPrefix;

    match NumberPrefix::binary(bytes as f64) {
        NumberPrefix::Standalone(b) => format!("{b}B"),
        NumberPrefix::Prefixed(prefix, n) => format!("{n:.1}{prefix}B"),
    }
}

/// What to do, decided by the number of paths and whether the first one is
/// remote
#[derive(Debug, PartialEq)]
enum Action<'a> {
    Download { remote: &'a str, local: &'a str },
    Upload { local: &'a str, remote: &'a str, public: bool },
    ListObjects { remote: &'a str },
    ListBuckets { project: &'a str },
}

impl Args {
    fn action(&self) -> anyhow::Result<Action<'_>> {
        Ok(match self.paths.as_slice() {
            [src, dst] if is_remote(src) => Action::Download {
                remote: src,
                local: dst,
            },
            [src, dst] => Action::Upload {
                local: src,
                remote: dst,
                public: self.public,
            },
            [target] if is_remote(target) => Action::ListObjects { remote: target },
            [project] => Action::ListBuckets {
                project: project.as_str(),
            },
            paths => anyhow::bail!("expected 1 or 2 paths, got {}", paths.len()),
        })
    }
}

fn execute<S: Storage>(
    store: &mut Store<S>,
    action: Action<'_>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match action {
        Action::Download { remote, local } => {
            let (local, size) = store.get(remote, Utf8Path::new(local))?;
            writeln!(
                out,
                "{} {remote} -> {local} {}",
                Color::Green.paint("OK"),
                Style::default().dimmed().paint(bytes_to_human(size)),
            )?;
        }
        Action::Upload {
            local,
            remote,
            public,
        } => {
            let size = store.put(Utf8Path::new(local), remote)?;
            if public {
                store
                    .chmod(remote, store::ALL_USERS, store::READER)
                    .context("failed to make object public")?;
            }
            writeln!(
                out,
                "{} {local} -> {remote} {}",
                Color::Green.paint("OK"),
                Style::default().dimmed().paint(bytes_to_human(size)),
            )?;
        }
        Action::ListObjects { remote } => {
            for object in store.ls(remote)? {
                writeln!(out, "{object}")?;
            }
        }
        Action::ListBuckets { project } => {
            for bucket in store.buckets(project)? {
                writeln!(out, "{bucket}")?;
            }
        }
    }

    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let action = args.action()?;
    let cache = args.config.prepare_cache()?;
    let auth = Authenticator::new(args.config.clone(), TokenCache::new(cache))?;
    let mut store = Store::new(Gcs::new(auth));

    execute(&mut store, action, &mut std::io::stdout().lock())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Err(err) => {
            if let Some(ar) = err.downcast_ref::<AuthorizationRequired>() {
                println!("Visit URL to get a code then run again with GSCP_CODE=YOUR_CODE");
                println!("{}", Color::Cyan.paint(ar.url.as_str()));
                std::process::exit(1);
            }

            Err(err)
        }
        Ok(()) => Ok(()),
    }
}
