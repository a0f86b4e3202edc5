use std::path::PathBuf;

use anyhow::{Result, bail};

const USAGE: &str = "usage: mailtrail-ingest [--invoke <batch.json|->] [config-path]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSource {
    Stdin,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Long-running TCP ingest server with the purge loop.
    Serve,
    /// Run exactly one invocation over a batch document and exit.
    Invoke(BatchSource),
}

#[derive(Debug)]
pub struct IngestArgs {
    pub config_path: Option<PathBuf>,
    pub mode: Mode,
}

impl IngestArgs {
    pub fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut config_path = None;
        let mut mode = Mode::Serve;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => bail!(USAGE),
                "--invoke" => {
                    let Some(source) = args.next() else {
                        bail!("missing value for --invoke ({USAGE})");
                    };
                    mode = Mode::Invoke(if source == "-" {
                        BatchSource::Stdin
                    } else {
                        BatchSource::File(PathBuf::from(source))
                    });
                }
                flag if flag.starts_with("--") => {
                    bail!("unknown argument: {flag} ({USAGE})");
                }
                path => {
                    if config_path.is_some() {
                        bail!("too many arguments: {path} ({USAGE})");
                    }
                    config_path = Some(PathBuf::from(path));
                }
            }
        }

        Ok(Self { config_path, mode })
    }
}
