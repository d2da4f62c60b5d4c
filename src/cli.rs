//! Command-line surface: `link` and `modify`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::elf::file::UnpreparedElfFile;
use crate::link::{link_files, LinkOptions};
use crate::modify::{self, AddrField};

#[derive(Parser, Debug)]
#[command(name = "elfweave")]
#[command(about = "Merge, link, and rewrite ELF images")]
#[command(version)]
pub struct Cli {
    /// Increase verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge relocatable objects into a linked executable
    Link {
        /// Input object files
        #[arg(required = true)]
        objects: Vec<PathBuf>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Override a section's placement address (NAME=ADDR)
        #[arg(long = "section-start", value_name = "NAME=ADDR")]
        section_start: Vec<String>,

        /// Use the kernel+SoC layout
        #[arg(long = "kernel-soc")]
        kernel_soc: bool,

        /// ARM RVCT toolchain section naming
        #[arg(long)]
        rvct: bool,

        /// Base virtual address for the layout
        #[arg(long, value_name = "ADDR", default_value = "0x8000")]
        base: String,
    },
    /// Rewrite an already-linked image
    Modify {
        /// Input ELF file
        file: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Rewrite segments to their physical address view
        #[arg(long)]
        physical: bool,

        /// Emit a flat binary instead of an ELF file
        #[arg(long)]
        binary: bool,

        /// Add a delta to an address field: --adjust FIELD DELTA
        #[arg(long, num_args = 2, value_names = ["FIELD", "DELTA"])]
        adjust: Vec<String>,

        /// Replace a field value: --change FIELD OLD=NEW
        #[arg(long, num_args = 2, value_names = ["FIELD", "OLD=NEW"])]
        change: Vec<String>,

        /// Collapse sections sharing a name prefix into one
        #[arg(long = "merge_sections", value_name = "PREFIX")]
        merge_sections: Option<String>,

        /// Materialize NOBITS sections as zero bytes
        #[arg(long = "remove_nobits")]
        remove_nobits: bool,
    },
}

fn parse_u64(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid address {:?}", text))
}

fn parse_i64(text: &str) -> Result<i64> {
    let text = text.trim();
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = parse_u64(rest)? as i64;
    Ok(if negative { -magnitude } else { magnitude })
}

fn parse_section_start(text: &str) -> Result<(String, u64)> {
    let (name, addr) = text
        .split_once('=')
        .with_context(|| format!("expected NAME=ADDR, got {:?}", text))?;
    Ok((name.to_string(), parse_u64(addr)?))
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Link {
            objects,
            output,
            section_start,
            kernel_soc,
            rvct,
            base,
        } => {
            let section_starts = section_start
                .iter()
                .map(|s| parse_section_start(s))
                .collect::<Result<Vec<_>>>()?;
            let opts = LinkOptions {
                base_addr: parse_u64(&base)?,
                kernel_soc,
                rvct,
                section_starts,
            };
            let paths: Vec<&Path> = objects.iter().map(|p| p.as_path()).collect();
            let prepared = link_files(&paths, &opts)
                .with_context(|| format!("linking {} objects", paths.len()))?;
            prepared
                .to_filename(&output)
                .with_context(|| format!("writing {}", output.display()))?;
        }
        Command::Modify {
            file,
            output,
            physical,
            binary,
            adjust,
            change,
            merge_sections,
            remove_nobits,
        } => {
            let mut elf = UnpreparedElfFile::from_file(&file)
                .with_context(|| format!("loading {}", file.display()))?;
            let wordsize = elf.wordsize.context("input file has no wordsize")?;
            let endian = elf.endian.context("input file has no endianness")?;

            if physical {
                modify::physical(&mut elf)?;
            }
            for pair in adjust.chunks(2) {
                let field = AddrField::parse(&pair[0])?;
                modify::adjust(&mut elf, field, parse_i64(&pair[1])?)?;
            }
            for pair in change.chunks(2) {
                let field = AddrField::parse(&pair[0])?;
                let (old, new) = pair[1]
                    .split_once('=')
                    .with_context(|| format!("expected OLD=NEW, got {:?}", pair[1]))?;
                modify::change(&mut elf, field, parse_u64(old)?, parse_u64(new)?)?;
            }
            if let Some(prefix) = merge_sections {
                modify::merge_sections(&mut elf, &prefix)?;
            }
            if remove_nobits {
                modify::remove_nobits(&mut elf)?;
            }

            if binary {
                let bytes = modify::binary(&elf)?;
                if bytes.is_empty() {
                    bail!("no loadable content to flatten");
                }
                std::fs::write(&output, bytes)
                    .with_context(|| format!("writing {}", output.display()))?;
            } else {
                elf.prepare(wordsize, endian)?
                    .to_filename(&output)
                    .with_context(|| format!("writing {}", output.display()))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(parse_u64("0x8000").unwrap(), 0x8000);
        assert_eq!(parse_u64("4096").unwrap(), 4096);
        assert!(parse_u64("0xzz").is_err());
        assert_eq!(parse_i64("+0x10").unwrap(), 16);
        assert_eq!(parse_i64("-8").unwrap(), -8);
    }

    #[test]
    fn section_start_parsing() {
        let (name, addr) = parse_section_start(".text=0xf0000000").unwrap();
        assert_eq!(name, ".text");
        assert_eq!(addr, 0xf000_0000);
        assert!(parse_section_start("no-equals").is_err());
    }

    #[test]
    fn cli_parses_link_invocation() {
        let cli = Cli::try_parse_from([
            "elfweave",
            "link",
            "a.o",
            "b.o",
            "-o",
            "out.elf",
            "--kernel-soc",
            "--section-start",
            ".text=0x100000",
        ])
        .unwrap();
        match cli.command {
            Command::Link { objects, kernel_soc, section_start, .. } => {
                assert_eq!(objects.len(), 2);
                assert!(kernel_soc);
                assert_eq!(section_start, vec![".text=0x100000".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn cli_parses_modify_invocation() {
        let cli = Cli::try_parse_from([
            "elfweave",
            "modify",
            "in.elf",
            "-o",
            "out.bin",
            "--binary",
            "--adjust",
            "vaddr",
            "+0x1000",
        ])
        .unwrap();
        match cli.command {
            Command::Modify { binary, adjust, .. } => {
                assert!(binary);
                assert_eq!(adjust, vec!["vaddr".to_string(), "+0x1000".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
