mod demo;
mod logging;
mod report;
mod signature_file;

use std::io;
use std::path::{Path, PathBuf};

use nbridge::{Abi, BridgeConfig, classify};
use tracing::{debug, info};

use report::ClassificationReport;
use signature_file::SignatureFile;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Classify(PathBuf),
    Emit,
    Demo,
    Abis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AbiSelection {
    Host,
    One(Abi),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    command: Option<Command>,
    abi: AbiSelection,
    json: bool,
    stack_size: Option<usize>,
    heap_size: Option<usize>,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            command: None,
            abi: AbiSelection::Host,
            json: false,
            stack_size: None,
            heap_size: None,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    let Some(command) = cli.command.clone().filter(|_| !cli.help) else {
        print_usage();
        return Ok(());
    };

    match command {
        Command::Classify(path) => run_classify(&cli, &path),
        Command::Emit => {
            for abi in selected_abis(&cli.abi)? {
                print!("{}", report::stub_listing(abi));
            }
            Ok(())
        }
        Command::Demo => {
            let defaults = BridgeConfig::default();
            let config = BridgeConfig {
                stack_size: cli.stack_size.unwrap_or(defaults.stack_size),
                heap_size: cli.heap_size.unwrap_or(defaults.heap_size),
                ..defaults
            };
            let failures = demo::run(config)?;
            if failures > 0 {
                return Err(io::Error::other(format!("{failures} self-test case(s) failed")).into());
            }
            info!("host self-test passed");
            Ok(())
        }
        Command::Abis => {
            let host = Abi::host();
            for abi in Abi::ALL {
                let marker = if Some(abi) == host { " (host)" } else { "" };
                println!(
                    "{:<12} {}-bit{marker}",
                    logging::abi_label(abi.name()),
                    abi.pointer_size() * 8
                );
            }
            Ok(())
        }
    }
}

fn run_classify(cli: &CliConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file = SignatureFile::load(path)?;
    let mut reports = Vec::new();
    for abi in selected_abis(&cli.abi)? {
        let signature = file.build(abi.pointer_size())?;
        match classify(abi, signature) {
            Ok(classified) => reports.push(ClassificationReport::new(&classified)),
            // Unsupported conventions are expected when sweeping every ABI.
            Err(err) if cli.abi == AbiSelection::All => {
                debug!(abi = abi.name(), error = %err, "skipping abi");
            }
            Err(err) => return Err(err.into()),
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print!("{}", report.render());
        }
    }
    Ok(())
}

fn selected_abis(selection: &AbiSelection) -> Result<Vec<Abi>, io::Error> {
    match selection {
        AbiSelection::All => Ok(Abi::ALL.to_vec()),
        AbiSelection::One(abi) => Ok(vec![*abi]),
        AbiSelection::Host => Abi::host().map(|abi| vec![abi]).ok_or_else(|| {
            io::Error::other(format!(
                "no known ABI for {}; pass --abi",
                std::env::consts::ARCH
            ))
        }),
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--json" => {
                cfg.json = true;
                index += 1;
            }
            "--all-abis" => {
                cfg.abi = AbiSelection::All;
                index += 1;
            }
            "--abi" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --abi".to_string())?;
                let abi = Abi::parse(raw).ok_or_else(|| format!("unknown abi '{raw}'"))?;
                cfg.abi = AbiSelection::One(abi);
                index += 2;
            }
            "--stack-size" => {
                cfg.stack_size = Some(parse_size(args, index, "--stack-size")?);
                index += 2;
            }
            "--heap-size" => {
                cfg.heap_size = Some(parse_size(args, index, "--heap-size")?);
                index += 2;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            word => {
                let command = match (&cfg.command, word) {
                    (None, "classify") => {
                        let path = args
                            .get(index + 1)
                            .ok_or_else(|| "classify needs a signature file".to_string())?;
                        index += 1;
                        Command::Classify(PathBuf::from(path))
                    }
                    (None, "emit") => Command::Emit,
                    (None, "demo") => Command::Demo,
                    (None, "abis") => Command::Abis,
                    (None, other) => return Err(format!("unknown command '{other}'")),
                    (Some(_), other) => return Err(format!("unexpected argument '{other}'")),
                };
                cfg.command = Some(command);
                index += 1;
            }
        }
    }

    Ok(cfg)
}

fn parse_size(args: &[String], index: usize, flag: &str) -> Result<usize, String> {
    let raw = args
        .get(index + 1)
        .ok_or_else(|| format!("missing value for {flag}"))?;
    let (digits, scale) = match raw.strip_suffix(['k', 'K']) {
        Some(digits) => (digits, 1024),
        None => match raw.strip_suffix(['m', 'M']) {
            Some(digits) => (digits, 1024 * 1024),
            None => (raw.as_str(), 1),
        },
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|value| value.checked_mul(scale))
        .ok_or_else(|| format!("invalid {flag} value '{raw}'"))
}

fn print_usage() {
    println!("Usage:");
    println!("  nb-inspect classify <signature.json> [--abi <name>|--all-abis] [--json]");
    println!("  nb-inspect emit [--abi <name>|--all-abis]");
    println!("  nb-inspect demo [--stack-size <n>[k|m]] [--heap-size <n>[k|m]]");
    println!("  nb-inspect abis");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> String {
        value.to_string()
    }

    #[test]
    fn parse_cli_defaults() {
        let cfg = parse_cli_args(&[]).expect("parse should succeed");
        assert!(cfg.command.is_none());
        assert_eq!(cfg.abi, AbiSelection::Host);
        assert!(!cfg.json);
        assert!(cfg.stack_size.is_none());
        assert!(!cfg.help);
    }

    #[test]
    fn parse_cli_classify_with_abi_and_json() {
        let cfg = parse_cli_args(&[
            s("classify"),
            s("sig.json"),
            s("--abi"),
            s("win64"),
            s("--json"),
        ])
        .expect("parse should succeed");
        assert_eq!(cfg.command, Some(Command::Classify(PathBuf::from("sig.json"))));
        assert_eq!(cfg.abi, AbiSelection::One(Abi::Win64));
        assert!(cfg.json);
    }

    #[test]
    fn parse_cli_demo_sizes_accept_suffixes() {
        let cfg = parse_cli_args(&[s("demo"), s("--stack-size"), s("64k"), s("--heap-size"), s("2M")])
            .expect("parse should succeed");
        assert_eq!(cfg.command, Some(Command::Demo));
        assert_eq!(cfg.stack_size, Some(64 * 1024));
        assert_eq!(cfg.heap_size, Some(2 * 1024 * 1024));
    }

    #[test]
    fn parse_cli_all_abis_for_emit() {
        let cfg = parse_cli_args(&[s("emit"), s("--all-abis")]).expect("parse should succeed");
        assert_eq!(cfg.command, Some(Command::Emit));
        assert_eq!(cfg.abi, AbiSelection::All);
    }

    #[test]
    fn parse_cli_rejects_bad_input() {
        let err = parse_cli_args(&[s("--abi")]).expect_err("missing value");
        assert_eq!(err, "missing value for --abi");
        let err = parse_cli_args(&[s("--abi"), s("sparc")]).expect_err("unknown abi");
        assert_eq!(err, "unknown abi 'sparc'");
        let err = parse_cli_args(&[s("--verbose")]).expect_err("unknown flag");
        assert_eq!(err, "unknown flag '--verbose'");
        let err = parse_cli_args(&[s("classify")]).expect_err("missing file");
        assert_eq!(err, "classify needs a signature file");
        let err = parse_cli_args(&[s("abis"), s("extra")]).expect_err("extra argument");
        assert_eq!(err, "unexpected argument 'extra'");
        let err = parse_cli_args(&[s("demo"), s("--heap-size"), s("lots")]).expect_err("bad size");
        assert_eq!(err, "invalid --heap-size value 'lots'");
    }
}
