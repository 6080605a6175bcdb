use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Command-line surface of a servent process.
///
/// `--first` and `--contact` are mutually exclusive bootstrap modes:
/// a first-machine servent starts the overlay, a contact servent joins
/// an existing one starting from the given seed.
#[derive(Parser, Debug)]
#[command(name = "servent", about = "A Gnutella-style file-sharing servent")]
pub struct Cli {
    /// Port this servent listens on for overlay and local connections.
    #[arg(short = 'l', long = "listen")]
    pub listen: u16,

    /// Start without joining an existing overlay.
    #[arg(short = 'f', long = "first", conflicts_with = "contact")]
    pub first: bool,

    /// Seed contact to join through: IP and port.
    #[arg(short = 'c', long = "contact", num_args = 2, value_names = ["IP", "PORT"])]
    pub contact: Option<Vec<String>>,

    /// Directory holding the files this servent shares.
    #[arg(long = "share-dir", default_value = "share")]
    pub share_dir: PathBuf,
}

/// Exit codes a servent process returns, per the CLI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    IoError = 1,
    NotEnoughArguments = 2,
    UnableToSpawn = 3,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// A parsed contact point, validated against the servent's port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub ip: IpAddr,
    pub port: u16,
}

pub fn is_valid_port(port: u16) -> bool {
    (1025..=65535).contains(&port)
}

impl Cli {
    /// Parses `--contact IP PORT` into a typed [`Contact`], validating
    /// the port range and that exactly one bootstrap mode was chosen.
    pub fn parsed_contact(&self) -> Result<Option<Contact>, String> {
        match &self.contact {
            None => Ok(None),
            Some(parts) => {
                let [ip, port] = parts.as_slice() else {
                    return Err("--contact requires exactly IP and PORT".into());
                };
                let ip: IpAddr = ip.parse().map_err(|_| format!("invalid IP: {ip}"))?;
                let port: u16 = port.parse().map_err(|_| format!("invalid port: {port}"))?;
                if !is_valid_port(port) {
                    return Err(format!("port {port} out of range 1025-65535"));
                }
                Ok(Some(Contact { ip, port }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_port_range() {
        assert!(is_valid_port(1025));
        assert!(is_valid_port(65535));
        assert!(!is_valid_port(1024));
        assert!(!is_valid_port(0));
    }
}
