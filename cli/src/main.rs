mod monitoring;

use std::path::PathBuf;
use std::process::ExitCode;

use bupflash::{BasicBctValidator, LinuxPlatform, Outcome, UpdateOptions, Updater};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
  name = "bupflash",
  version,
  about = "update or initialize boot firmware partitions from a bootloader update package",
  long_about = None
)]
struct Args {
  /// Initialize the entire set of boot partitions
  #[arg(short, long, action, conflicts_with = "slot_suffix")]
  initialize: bool,
  /// Update only the redundant boot partitions with the specified suffix (with no slot metadata update)
  #[arg(short, long, value_name = "_a|_b")]
  slot_suffix: Option<String>,
  /// Do not perform any writes, just show what would be written
  #[arg(short = 'n', long, action)]
  dry_run: bool,
  /// Check if the boot device needs repartitioning
  #[arg(short = 'N', long, action)]
  needs_repartition: bool,
  /// Pathname of the bootloader update package
  package: PathBuf,
}

fn main() -> ExitCode {
  monitoring::init_logger();
  let args = match Args::try_parse() {
    Ok(args) => args,
    Err(err) => {
      // help and version land on stdout and exit 0; real usage errors
      // exit 1
      let _ = err.print();
      return ExitCode::from(if err.use_stderr() { 1 } else { 0 });
    }
  };

  let slot_suffix = match args.slot_suffix.as_deref() {
    None => None,
    Some("_a") => Some(String::new()),
    Some("_b") => Some("_b".to_string()),
    Some(other) => {
      tracing::error!("slot suffix must be either _a or _b (got {})", other);
      return ExitCode::from(1);
    }
  };

  let mut opts = UpdateOptions::new(args.package);
  opts.initialize = args.initialize;
  opts.slot_suffix = slot_suffix;
  opts.dry_run = args.dry_run || args.needs_repartition;
  opts.check_only = args.needs_repartition;

  let platform = LinuxPlatform;
  let validator = BasicBctValidator;
  match Updater::new(&opts, &platform, &validator).run() {
    Ok(outcome) => {
      match outcome {
        Outcome::Completed => tracing::info!("done!"),
        Outcome::RepartitionNeeded => tracing::info!("boot device needs repartitioning"),
        Outcome::NoRepartitionNeeded => tracing::info!("boot device does not need repartitioning"),
        Outcome::CompareFailed => {}
      }
      ExitCode::from(outcome.exit_code() as u8)
    }
    Err(err) => {
      tracing::error!("{}", err);
      ExitCode::from(1)
    }
  }
}
