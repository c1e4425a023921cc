use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::format::CardFormat;
use crate::signatures::Variables;
use crate::tables::CopyId;
use crate::types::ScanConfig;

/// Memory card image validation and lost-file recovery
#[derive(Parser, Debug, Clone)]
#[command(name = "memcard-recovery")]
#[command(version)]
#[command(about = "Memory card image validation and lost-file recovery", long_about = None)]
pub struct Args {
    /// Raw card image file
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Checksum scheme of the card firmware
    #[arg(long = "format", value_enum, default_value = "standard")]
    pub format: FormatArg,

    /// Force a directory copy (must be valid)
    #[arg(long = "use-directory", value_enum)]
    pub use_directory: Option<CopyArg>,

    /// Force a block table copy (must be valid)
    #[arg(long = "use-block-table", value_enum)]
    pub use_block_table: Option<CopyArg>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show header, table selection and diagnostics
    Info,

    /// List files of the active directory
    List,

    /// Scan unclaimed blocks for lost files
    Scan(ScanArgs),

    /// Export one active file by directory slot
    Export {
        /// Directory slot of the file
        #[arg(long = "slot")]
        slot: usize,

        /// Destination of the raw bytes
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScanArgs {
    /// JSON list of descriptor templates
    #[arg(short = 'd', long = "descriptors", value_name = "FILE")]
    pub descriptors: PathBuf,

    /// Template variable, NAME=HEX or NAME=#DECIMAL (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Write a JSON report here
    #[arg(long = "report")]
    pub report: Option<PathBuf>,

    /// Write each recovered file's bytes into this directory
    #[arg(long = "export-dir")]
    pub export_dir: Option<PathBuf>,

    /// Try descriptors of every region
    #[arg(long = "no-region-filter")]
    pub no_region_filter: bool,

    /// Descriptor count from which matching runs in parallel
    #[arg(long = "parallel-threshold", default_value = "64")]
    pub parallel_threshold: usize,

    /// Blocks handed to each search expression
    #[arg(long = "match-window", default_value = "1")]
    pub match_window: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Standard,
    Revised,
}

impl From<FormatArg> for CardFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Standard => CardFormat::standard(),
            FormatArg::Revised => CardFormat::revised(),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyArg {
    A,
    B,
}

impl From<CopyArg> for CopyId {
    fn from(arg: CopyArg) -> Self {
        match arg {
            CopyArg::A => CopyId::A,
            CopyArg::B => CopyId::B,
        }
    }
}

impl Args {
    /// Validate the arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.image.as_os_str().is_empty() {
            return Err("Image path cannot be empty".to_string());
        }

        if let Command::Scan(scan) = &self.command {
            if scan.match_window == 0 {
                return Err("match-window must be at least 1".to_string());
            }
            scan.variables()?;
        }

        Ok(())
    }

    pub fn card_format(&self) -> CardFormat {
        self.format.into()
    }
}

impl ScanArgs {
    /// Parse every `--var` assignment
    pub fn variables(&self) -> Result<Variables, String> {
        let mut variables = Variables::new();
        for assignment in &self.vars {
            let (name, value) = Variables::parse_assignment(assignment).map_err(|e| e.to_string())?;
            if variables.insert(name.clone(), value).is_some() {
                return Err(format!("variable {} given twice", name));
            }
        }
        Ok(variables)
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig::new(!self.no_region_filter, self.parallel_threshold).with_match_window(self.match_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_args_validation() {
        let args = parse(&["memcard-recovery", "card.raw", "info"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.card_format(), CardFormat::standard());
    }

    #[test]
    fn test_scan_args() {
        let args = parse(&[
            "memcard-recovery",
            "--format",
            "revised",
            "card.raw",
            "scan",
            "-d",
            "saves.json",
            "--var",
            "region=45",
            "--var",
            "multiplier=#2",
            "--no-region-filter",
        ]);
        assert!(args.validate().is_ok());
        assert_eq!(args.card_format(), CardFormat::revised());

        let Command::Scan(scan) = &args.command else {
            panic!("expected scan command");
        };
        assert_eq!(scan.variables().unwrap().len(), 2);
        let config = scan.scan_config();
        assert!(!config.region_filter);
        assert_eq!(config.parallel_threshold, 64);
    }

    #[test]
    fn test_invalid_scan_args() {
        let bad_var = parse(&["memcard-recovery", "card.raw", "scan", "-d", "d.json", "--var", "region"]);
        assert!(bad_var.validate().is_err());

        let twice = parse(&[
            "memcard-recovery", "card.raw", "scan", "-d", "d.json", "--var", "a=00", "--var", "a=01",
        ]);
        assert!(twice.validate().is_err());

        let window = parse(&["memcard-recovery", "card.raw", "scan", "-d", "d.json", "--match-window", "0"]);
        assert!(window.validate().is_err());
    }

    #[test]
    fn test_copy_overrides() {
        let args = parse(&["memcard-recovery", "--use-directory", "b", "card.raw", "list"]);
        assert_eq!(args.use_directory.map(CopyId::from), Some(CopyId::B));
        assert_eq!(args.use_block_table, None);
    }
}
