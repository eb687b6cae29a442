use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use super::{Binaries, Command, Session, SessionRecord, gzip};

pub const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(20);
pub const HEALTHCHECK_ID: &str = "healthcheck";
const HEALTHCHECK_OWNER: &str = "system";
/// Console window between health check steps, in seconds.
const SETTLE_SECS: &str = "2";

/// The job every worker must pass before it is handed queued work.
///
/// Binaries whose name ends in `.bit` are loaded as bitstreams, everything
/// else is bootstrapped as firmware. Each step is followed by a short console
/// window. Without binaries the check only opens a console window.
#[derive(Debug, Clone, Default)]
pub struct Healthcheck {
    binaries: Binaries,
}

impl Healthcheck {
    pub fn new(binaries: Binaries) -> Self {
        Self { binaries }
    }

    /// Reads each configured `name -> path` binary from disk, gzip-compressed.
    pub async fn load(paths: &BTreeMap<String, PathBuf>) -> Result<Self> {
        let mut binaries = Binaries::new();
        for (name, path) in paths {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading health check binary {}", path.display()))?;
            let packed = gzip::compress(&bytes).with_context(|| format!("compressing {}", path.display()))?;
            binaries.insert(name.clone(), packed);
        }
        Ok(Self { binaries })
    }

    pub fn binaries(&self) -> &Binaries {
        &self.binaries
    }

    pub fn commands(&self) -> Vec<Command> {
        let (bitstreams, firmware): (Vec<&String>, Vec<&String>) =
            self.binaries.keys().partition(|name| is_bitstream(name));
        let mut commands = Vec::new();
        for name in bitstreams {
            commands.push(command(&["load-bitstream", name]));
            commands.push(command(&["console", SETTLE_SECS]));
        }
        for name in firmware {
            commands.push(command(&["bootstrap", name]));
            commands.push(command(&["console", SETTLE_SECS]));
        }
        if commands.is_empty() {
            commands.push(command(&["console", SETTLE_SECS]));
        }
        commands
    }

    /// A fresh temporary session running the check.
    pub fn session(&self) -> Arc<Session> {
        Session::temporary(SessionRecord::new(
            HEALTHCHECK_ID.to_string(),
            HEALTHCHECK_OWNER.to_string(),
            self.binaries.clone(),
            self.commands(),
            HEALTHCHECK_TIMEOUT,
        ))
    }
}

fn is_bitstream(name: &str) -> bool {
    Path::new(name).extension().is_some_and(|ext| ext == "bit")
}

fn command(parts: &[&str]) -> Command {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    #[test]
    fn test_commands_load_bitstreams_before_firmware() {
        let mut binaries = Binaries::new();
        binaries.insert("fw.bin".to_string(), vec![1]);
        binaries.insert("top.bit".to_string(), vec![2]);
        let check = Healthcheck::new(binaries);
        assert_eq!(
            check.commands(),
            vec![
                command(&["load-bitstream", "top.bit"]),
                command(&["console", "2"]),
                command(&["bootstrap", "fw.bin"]),
                command(&["console", "2"]),
            ]
        );
    }

    #[test]
    fn test_empty_check_only_watches_the_console() {
        assert_eq!(Healthcheck::default().commands(), vec![command(&["console", "2"])]);
    }

    #[test]
    fn test_session_is_temporary() {
        let session = Healthcheck::default().session();
        assert!(session.is_temporary());
        assert_eq!(session.status(), SessionStatus::Pending);
        assert_eq!(session.record().timeout, HEALTHCHECK_TIMEOUT);
    }

    #[tokio::test]
    async fn test_load_reads_and_compresses_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bit");
        std::fs::write(&path, b"bits").unwrap();
        let mut paths = BTreeMap::new();
        paths.insert("top.bit".to_string(), path);

        let check = Healthcheck::load(&paths).await.unwrap();
        let packed = check.binaries().get("top.bit").unwrap().clone();
        assert!(gzip::is_compressed(&packed));
        assert_eq!(gzip::decompress(packed).unwrap(), b"bits".to_vec());

        paths.insert("missing.bin".to_string(), dir.path().join("missing.bin"));
        assert!(Healthcheck::load(&paths).await.is_err());
    }
}
