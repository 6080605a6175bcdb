use std::net::IpAddr;
use std::path::PathBuf;

use crate::cli::Cli;

/// Resolved, validated servent configuration — the typed equivalent of
/// the scattered globals a C implementation would derive from `argv`.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub contact: Option<(IpAddr, u16)>,
    pub share_dir: PathBuf,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, String> {
        if !crate::cli::is_valid_port(cli.listen) {
            return Err(format!("listen port {} out of range 1025-65535", cli.listen));
        }
        let contact = cli.parsed_contact()?.map(|c| (c.ip, c.port));
        if !cli.first && contact.is_none() {
            return Err("must pass either --first or --contact IP PORT".into());
        }
        Ok(Self {
            listen_port: cli.listen,
            contact,
            share_dir: cli.share_dir.clone(),
        })
    }
}
