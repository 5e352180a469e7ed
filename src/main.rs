// src/main.rs

use alam::config::Options;
use alam::db::Database;
use alam::transaction::{
    CancellationToken, Event, Progress, Question, TransFlags, Transaction, TransactionObserver,
};
use alam::{Error, Handle};
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "alam")]
#[command(author, version, about = "Install, upgrade and remove packages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[arg(long, global = true, default_value = "/etc/alam.toml")]
    config: PathBuf,

    /// Install root (overrides the configuration file)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Database directory (overrides the configuration file)
    #[arg(short = 'b', long, global = true)]
    dbpath: Option<PathBuf>,

    /// Answer every question with its default
    #[arg(long, global = true)]
    noconfirm: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Skip dependency checks
    #[arg(short = 'd', long, global = true)]
    nodeps: bool,

    /// Skip file conflict checks and overwrite files
    #[arg(short, long, global = true)]
    force: bool,

    /// Do not run install scriptlets
    #[arg(long, global = true)]
    noscriptlet: bool,

    /// Only modify database entries, not package files
    #[arg(long, global = true)]
    dbonly: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install package files
    Install {
        /// Paths to the package files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Remove installed packages
    Remove {
        /// Package names
        #[arg(required = true)]
        names: Vec<String>,
        /// Also remove packages depending on the targets
        #[arg(short, long)]
        cascade: bool,
        /// Also remove dependencies nothing else needs
        #[arg(short = 's', long)]
        recursive: bool,
        /// Delete modified backup files instead of saving them as .pacsave
        #[arg(short, long)]
        nosave: bool,
    },
    /// Install packages from the sync repositories
    Sync {
        /// Package names or dependencies, optionally as repo/name
        #[arg(required = true)]
        targets: Vec<String>,
        /// Skip targets that are already up to date
        #[arg(long)]
        needed: bool,
        /// Only download the packages
        #[arg(short = 'w', long)]
        downloadonly: bool,
    },
    /// Upgrade every installed package
    Upgrade {
        /// Allow replacing packages with older repository versions
        #[arg(long)]
        downgrade: bool,
    },
    /// List installed packages
    Query {
        /// Regular expression matched against names and descriptions
        pattern: Option<String>,
    },
    /// Search the sync repositories
    Search {
        /// Regular expressions, all of which must match
        #[arg(required = true)]
        needles: Vec<String>,
    },
    /// Compare two version strings
    Vercmp { a: String, b: String },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Flags shared by every transaction
    fn flags(&self) -> TransFlags {
        let mut flags = TransFlags::empty();
        flags.set(TransFlags::NODEPS, self.nodeps);
        flags.set(TransFlags::FORCE, self.force);
        flags.set(TransFlags::NOSCRIPTLET, self.noscriptlet);
        flags.set(TransFlags::DBONLY, self.dbonly);
        flags
    }

    fn options(&self) -> Result<Options> {
        let mut options = if self.config.is_file() {
            Options::load(&self.config)?
        } else {
            debug!("{} not found, using defaults", self.config.display());
            Options::default()
        };
        if let Some(root) = &self.root {
            options.root = root.clone();
        }
        if let Some(dbpath) = &self.dbpath {
            options.dbpath = dbpath.clone();
        }
        Ok(options)
    }
}

/// Ask a yes/no question on the terminal
fn confirm(prompt: &str, default: bool) -> bool {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    print!(":: {} {} ", prompt, hint);
    if io::stdout().flush().is_err() {
        return default;
    }

    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return default;
    }
    match answer.trim().to_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    }
}

/// Prints progress and asks questions on the terminal
struct CliObserver {
    noconfirm: bool,
}

impl TransactionObserver for CliObserver {
    fn on_event(&mut self, event: Event<'_>) {
        match event {
            Event::CheckDepsStart => println!("checking dependencies..."),
            Event::ResolveDepsStart => println!("resolving dependencies..."),
            Event::InterConflictsStart => println!("looking for inter-conflicts..."),
            Event::FileConflictsStart => println!("checking for file conflicts..."),
            Event::IntegrityStart => println!("checking package integrity..."),
            Event::DeltaIntegrityStart => println!("checking delta integrity..."),
            Event::DeltaPatchesStart => println!("applying deltas..."),
            Event::DeltaPatchStart { to, delta } => println!("generating {} with {}... ", to, delta),
            Event::DeltaPatchFailed => println!("delta patch failed"),
            Event::RetrieveStart(repo) => println!(":: Retrieving packages from {}...", repo),
            Event::AddDone(pkg) => println!("installed {}", pkg),
            Event::UpgradeDone { new, old } => {
                println!("upgraded {} ({} -> {})", new.name, old.version, new.version)
            }
            Event::RemoveDone(pkg) => println!("removed {}", pkg),
            _ => {}
        }
    }

    fn on_question(&mut self, question: Question<'_>) -> bool {
        let default = question.default_answer();
        if self.noconfirm {
            return default;
        }

        let prompt = match question {
            Question::InstallIgnored(pkg) => {
                format!("{} is in IgnorePkg/IgnoreGroup. Install anyway?", pkg.name)
            }
            Question::ReplacePackage { old, new, repo } => {
                format!("Replace {} with {}/{}?", old.name, repo, new.name)
            }
            Question::ConflictPackage { target, local, .. } => {
                format!("{} and {} are in conflict. Remove {}?", target, local, local)
            }
            Question::CorruptedPackage(file) => {
                format!("File {} is corrupted. Do you want to delete it?", file)
            }
            Question::RemovePackages(pkgs) => {
                let names: Vec<String> = pkgs.iter().map(ToString::to_string).collect();
                format!(
                    "The following packages cannot be upgraded due to unresolvable dependencies:\n      {}\n\nDo you want to skip them for this upgrade?",
                    names.join("  ")
                )
            }
        };
        confirm(&prompt, default)
    }

    fn on_progress(&mut self, progress: Progress, name: &str, percent: u8, howmany: usize, current: usize) {
        if percent != 100 {
            return;
        }
        let action = match progress {
            Progress::AddStart => "installing",
            Progress::UpgradeStart => "upgrading",
            Progress::RemoveStart => "removing",
            Progress::ConflictsStart | Progress::Download => return,
        };
        println!("({}/{}) {} {}", current, howmany, action, name);
    }
}

/// Print the details an error carries
fn report(err: &Error) {
    match err {
        Error::UnsatisfiedDependencies(missing) => {
            for miss in missing {
                eprintln!(":: {}", miss);
            }
        }
        Error::ConflictingDependencies(conflicts) => {
            for conflict in conflicts {
                eprintln!(":: {}", conflict);
            }
        }
        Error::FileConflicts(conflicts) => {
            for conflict in conflicts {
                eprintln!("{}", conflict);
            }
        }
        Error::PackageFilesInvalid(files) | Error::DeltaInvalid(files) => {
            for file in files {
                eprintln!("{} is invalid or corrupted", file);
            }
        }
        _ => {}
    }
}

/// Enlist targets, prepare and commit one transaction
fn run_transaction(
    handle: &mut Handle,
    flags: TransFlags,
    noconfirm: bool,
    enlist: impl FnOnce(&mut Transaction<'_>) -> alam::Result<()>,
) -> Result<()> {
    let observer = Box::new(CliObserver { noconfirm });
    let mut trans = Transaction::init(handle, flags, observer)?;

    let prepared = enlist(&mut trans).and_then(|()| trans.prepare());
    if let Err(e) = prepared {
        report(&e);
        return Err(e).context("failed to prepare transaction");
    }

    if trans.targets().is_empty() && trans.removals().is_empty() {
        println!(" there is nothing to do");
        return Ok(());
    }

    if !trans.removals().is_empty() {
        let names: Vec<String> = trans.removals().iter().map(ToString::to_string).collect();
        println!("\nRemove ({}): {}", names.len(), names.join("  "));
    }
    if !trans.targets().is_empty() {
        let names: Vec<String> = trans.targets().iter().map(ToString::to_string).collect();
        let download: u64 = trans.targets().iter().filter_map(|p| p.download_size).sum();
        println!("\nTargets ({}): {}", names.len(), names.join("  "));
        if download > 0 {
            println!("\nTotal Download Size:    {:.2} MiB", download as f64 / 1048576.0);
        }
    }
    println!();

    if !noconfirm && !confirm("Proceed with transaction?", true) {
        return Ok(());
    }

    let token = CancellationToken::new();
    if let Err(e) = trans.commit(&token) {
        report(&e);
        return Err(e).context("failed to commit transaction");
    }

    if !trans.failed().is_empty() {
        anyhow::bail!("errors occurred, packages with problems: {}", trans.failed().join(", "));
    }
    trans.release();
    Ok(())
}

fn print_packages<'a>(db: &Database, pkgs: impl IntoIterator<Item = &'a alam::packages::Package>, verbose: bool) {
    for pkg in pkgs {
        if db.is_local() {
            println!("{} {}", pkg.name, pkg.version);
        } else {
            println!("{}/{} {}", db.name(), pkg.name, pkg.version);
        }
        if verbose {
            if let Some(desc) = &pkg.desc {
                println!("    {}", desc);
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let Some(command) = &cli.command else {
        println!("alam v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'alam --help' for usage information");
        return Ok(());
    };

    match command {
        Commands::Vercmp { a, b } => {
            let ord = alam::version::compare(a, b);
            println!("{}", ord as i8);
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "alam", &mut io::stdout());
            Ok(())
        }
        Commands::Query { pattern } => {
            let handle = Handle::open(cli.options()?)?;
            let local = handle.local();
            match pattern {
                Some(pattern) => print_packages(local, local.search(std::slice::from_ref(pattern))?, false),
                None => print_packages(local, local.packages(), false),
            }
            Ok(())
        }
        Commands::Search { needles } => {
            let handle = Handle::open(cli.options()?)?;
            for db in handle.syncs() {
                print_packages(db, db.search(needles)?, true);
            }
            Ok(())
        }
        Commands::Install { files } => {
            let mut handle = Handle::open(cli.options()?)?;
            info!("installing {} package file(s)", files.len());
            run_transaction(&mut handle, cli.flags(), cli.noconfirm, |trans| {
                files.iter().try_for_each(|file| trans.add_target(file))
            })
        }
        Commands::Remove {
            names,
            cascade,
            recursive,
            nosave,
        } => {
            let mut flags = cli.flags();
            flags.set(TransFlags::CASCADE, *cascade);
            flags.set(TransFlags::RECURSE, *recursive);
            flags.set(TransFlags::NOSAVE, *nosave);

            let mut handle = Handle::open(cli.options()?)?;
            run_transaction(&mut handle, flags, cli.noconfirm, |trans| {
                names.iter().try_for_each(|name| trans.remove_target(name))
            })
        }
        Commands::Sync {
            targets,
            needed,
            downloadonly,
        } => {
            let mut flags = cli.flags();
            flags.set(TransFlags::NEEDED, *needed);
            flags.set(TransFlags::DOWNLOADONLY, *downloadonly);

            let mut handle = Handle::open(cli.options()?)?;
            run_transaction(&mut handle, flags, cli.noconfirm, |trans| {
                targets.iter().try_for_each(|target| trans.sync_target(target))
            })
        }
        Commands::Upgrade { downgrade } => {
            let mut handle = Handle::open(cli.options()?)?;
            println!(":: Starting full system upgrade...");
            run_transaction(&mut handle, cli.flags(), cli.noconfirm, |trans| {
                trans.sysupgrade(*downgrade)
            })
        }
    }
}
