//! test161 - command-line client
//!
//! Runs tests and targets against an installed kernel, lists what the test
//! tree provides, and builds kernels for targets.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use test161::{ClientConfig, GroupReport, TestEnvironment, TestResult};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "test161")]
#[command(version)]
#[command(about = "Run and score OS/161 kernel tests", long_about = None)]
struct Cli {
    /// Configuration file; searched upward from the working directory when
    /// omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests, tags or a target
    Run {
        /// Target names, test paths, globs or tags
        #[arg(required = true)]
        names: Vec<String>,
        /// Run one test at a time
        #[arg(long, short = 's')]
        sequential: bool,
        /// Do not run dependencies
        #[arg(long)]
        no_deps: bool,
        /// Treat names as tags first
        #[arg(long)]
        tag: bool,
        /// Seed for randomized command arguments
        #[arg(long)]
        seed: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List what the test tree provides
    List {
        #[arg(value_enum)]
        what: ListKind,
    },
    /// Build the kernel for a target
    Build {
        /// Target name
        target: String,
        /// Source repository URL or path
        #[arg(long)]
        repo: String,
        /// Branch, tag or commit to check out
        #[arg(long = "ref", default_value = "")]
        commit_ref: String,
        /// Scratch directory for the checkout
        #[arg(long, default_value = "build")]
        work: PathBuf,
        /// Install root; the configured rootdir when omitted
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ListKind {
    Tests,
    Tags,
    Targets,
    Commands,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::discover(&std::env::current_dir()?)?,
    };

    match cli.command {
        Commands::Run {
            names,
            sequential,
            no_deps,
            tag,
            seed,
            json,
        } => {
            if sequential {
                config.parallelism = 1;
            }
            let env = TestEnvironment::from_config(&config)
                .context("failed to load test environment")?;

            let manager = Arc::clone(&env.manager);
            ctrlc::set_handler(move || {
                eprintln!("[test161] Interrupted, waiting for running tests...");
                manager.stop();
            })?;

            let mut rng = match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            };
            let group = env.group_from_names(&names, !no_deps, tag, &mut rng)?;
            let report = env.run_group(group);
            env.manager.stop();

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if !report.all_correct() {
                std::process::exit(1);
            }
        }

        Commands::List { what } => {
            let env = TestEnvironment::from_config(&config)?;
            match what {
                ListKind::Tests => {
                    println!("\n{:<40} {:<32} {}", "ID", "NAME", "TAGS");
                    println!("{}", "-".repeat(100));
                    for test in env.tests.tests() {
                        println!(
                            "{:<40} {:<32} {}",
                            test.dependency_id,
                            test.name,
                            test.tags.join(", ")
                        );
                    }
                }
                ListKind::Tags => {
                    for (tag, tests) in env.tests.tags() {
                        println!("{}", tag.bold());
                        for id in tests {
                            println!("  {}", id);
                        }
                    }
                }
                ListKind::Targets => {
                    println!("\n{:<20} {:<8} {:<12} {:<8} {}", "NAME", "VERSION", "TYPE", "POINTS", "FILE");
                    println!("{}", "-".repeat(80));
                    for target in env.targets.values() {
                        println!(
                            "{:<20} {:<8} {:<12} {:<8} {}",
                            target.name,
                            target.version,
                            format!("{:?}", target.kind).to_lowercase(),
                            target.points,
                            target.file_name
                        );
                    }
                }
                ListKind::Commands => {
                    for tmpl in env.registry.iter() {
                        println!("{}", tmpl.name);
                    }
                }
            }
        }

        Commands::Build {
            target,
            repo,
            commit_ref,
            work,
            dest,
        } => {
            let env = TestEnvironment::from_config(&config)?;
            let Some(t) = env.targets.get(&target) else {
                bail!("unknown target: {}", target);
            };
            let root = match dest.or_else(|| config.rootdir.clone()) {
                Some(root) => root,
                None => bail!("no install root: pass --dest or set rootdir"),
            };
            println!("Building {} from {}", t.name, repo);
            let root = env.build(t, &repo, &commit_ref, &work, &root)?;
            println!("{} kernel installed in {}", "✓".green(), root.display());
        }
    }

    Ok(())
}

fn result_label(result: TestResult) -> colored::ColoredString {
    match result {
        TestResult::Correct => result.as_str().green(),
        TestResult::Skip => result.as_str().yellow(),
        TestResult::Abort => result.as_str().red().bold(),
        TestResult::Incorrect | TestResult::None => result.as_str().red(),
    }
}

fn print_report(report: &GroupReport) {
    println!(
        "\n{:<36} {:<10} {:<10} {:<8} {}",
        "TEST", "RESULT", "STATUS", "SCORE", "MESSAGE"
    );
    println!("{}", "-".repeat(100));
    for row in &report.rows {
        let score = if row.points_available > 0 {
            format!("{}/{}", row.points_earned, row.points_available)
        } else {
            "-".to_string()
        };
        println!(
            "{:<36} {:<10} {:<10} {:<8} {}",
            row.id,
            result_label(row.result),
            row.status,
            score,
            row.message
        );
        if row.mem_leak_deducted > 0 {
            println!("{:<36} {}", "", format!("memory leak: -{}", row.mem_leak_deducted).yellow());
        }
    }
    println!("{}", "-".repeat(100));
    println!(
        "Total: {} correct, {} incorrect, {} skipped, {} aborted",
        report.correct, report.incorrect, report.skipped, report.aborted
    );
    if report.points_available > 0 {
        println!("Score: {}/{}", report.points_earned, report.points_available);
    }
}
