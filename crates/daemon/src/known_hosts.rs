// Tunnel Bridge - Known Hosts Module
// SSH host key verification against an OpenSSH-style known_hosts file

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Outcome of looking a host key up
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyStatus {
    /// A stored key for this host matches
    Trusted,
    /// No key stored for this host
    Unknown,
    /// Keys are stored for this host but none match
    Changed {
        stored_fingerprint: String,
        offered_fingerprint: String,
        line: usize,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    /// Comma-separated patterns, e.g. "db.example.com,10.0.0.4" or "[bastion]:2222"
    hosts: Vec<String>,
    key_type: String,
    /// Base64 of the SSH wire-format public key blob
    key_blob: String,
    comment: Option<String>,
    line: usize,
}

impl Entry {
    fn parse(raw: &str, line: usize) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            return None;
        }

        let mut fields = raw.split_whitespace();
        let first = fields.next()?;

        // Markers (@cert-authority, @revoked) and hashed hosts are not supported
        if first.starts_with('@') || first.starts_with("|1|") {
            debug!("Skipping unsupported known_hosts entry on line {}", line);
            return None;
        }

        let (key_type, key_blob) = match (fields.next(), fields.next()) {
            (Some(t), Some(b)) => (t.to_string(), b.to_string()),
            _ => {
                warn!("Malformed known_hosts entry on line {}", line);
                return None;
            }
        };
        let comment: Vec<&str> = fields.collect();

        Some(Entry {
            hosts: first.split(',').map(str::to_string).collect(),
            key_type,
            key_blob,
            comment: (!comment.is_empty()).then(|| comment.join(" ")),
            line,
        })
    }

    fn to_line(&self) -> String {
        let mut line = format!("{} {} {}", self.hosts.join(","), self.key_type, self.key_blob);
        if let Some(comment) = &self.comment {
            line.push(' ');
            line.push_str(comment);
        }
        line
    }

    fn covers(&self, host: &str, port: u16) -> bool {
        let wanted = host_pattern(host, port);
        self.hosts.iter().any(|h| *h == wanted)
    }

    fn fingerprint(&self) -> String {
        match STANDARD.decode(self.key_blob.as_bytes()) {
            Ok(blob) => fingerprint_of_blob(&blob),
            Err(_) => format!("<undecodable key on line {}>", self.line),
        }
    }
}

/// In-memory copy of a known_hosts file
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl KnownHosts {
    /// Read the file at `path`; a missing file yields an empty set
    pub fn load_from(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read known_hosts file: {}", path.display()))?;
            let entries: Vec<Entry> = contents
                .lines()
                .enumerate()
                .filter_map(|(idx, line)| Entry::parse(line, idx + 1))
                .collect();
            debug!("Loaded {} known host keys from {}", entries.len(), path.display());
            entries
        } else {
            info!("known_hosts file does not exist yet: {}", path.display());
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let offered = key.public_key_base64();
        let mut candidates = self.entries.iter().filter(|e| e.covers(host, port)).peekable();

        let first = match candidates.peek() {
            Some(entry) => (*entry).clone(),
            None => return HostKeyStatus::Unknown,
        };

        if candidates.any(|e| e.key_blob == offered) {
            return HostKeyStatus::Trusted;
        }

        HostKeyStatus::Changed {
            stored_fingerprint: first.fingerprint(),
            offered_fingerprint: fingerprint(key),
            line: first.line,
        }
    }

    /// Record a key for host/port (in memory; call `save` to persist)
    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        let key_blob = key.public_key_base64();
        let key_type = key_type_of_blob(&key.public_key_bytes());
        self.entries.push(Entry {
            hosts: vec![host_pattern(host, port)],
            key_type,
            key_blob,
            comment: None,
            line: self.entries.len() + 1,
        });
    }

    /// Rewrite the file with all entries, creating parent directories as needed
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create known_hosts directory")?;
        }

        let mut file = fs::File::create(&self.path)
            .with_context(|| format!("Failed to write known_hosts file: {}", self.path.display()))?;
        writeln!(file, "# Tunnel Bridge - Known Hosts")?;
        for entry in &self.entries {
            writeln!(file, "{}", entry.to_line())?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .context("Failed to set known_hosts file permissions")?;
        }

        info!("Saved {} host keys to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// known_hosts host field: bare host on port 22, "[host]:port" otherwise
fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Algorithm name is the first length-prefixed string of the wire blob
fn key_type_of_blob(blob: &[u8]) -> String {
    blob.get(..4)
        .map(|len| u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
        .and_then(|len| blob.get(4..4 + len))
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

fn fingerprint_of_blob(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// OpenSSH-style SHA256 fingerprint
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_of_blob(&key.public_key_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILkEtuzbVQaextdhNMd2vwKkdyaNL5wNNfiP9jnvPeQY test";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAID6PaAxOLn3gCm4IaMNTkpt9N7CaCwzstXEMIA2L32KJ test";

    fn key(openssh: &str) -> PublicKey {
        PublicKey::from_openssh(openssh).unwrap()
    }

    #[test]
    fn test_host_pattern() {
        assert_eq!(host_pattern("bastion.example.com", 22), "bastion.example.com");
        assert_eq!(host_pattern("bastion.example.com", 2222), "[bastion.example.com]:2222");
    }

    #[test]
    fn test_entry_parse() {
        let entry = Entry::parse("db.example.com,10.0.0.4 ssh-ed25519 AAAA my laptop", 7).unwrap();
        assert_eq!(entry.hosts, vec!["db.example.com", "10.0.0.4"]);
        assert_eq!(entry.key_type, "ssh-ed25519");
        assert_eq!(entry.comment.as_deref(), Some("my laptop"));
        assert_eq!(entry.line, 7);
        assert!(entry.covers("10.0.0.4", 22));
        assert!(!entry.covers("10.0.0.4", 2222));

        assert!(Entry::parse("# comment", 1).is_none());
        assert!(Entry::parse("@cert-authority *.example.com ssh-rsa AAAA", 1).is_none());
        assert!(Entry::parse("host-only", 1).is_none());
    }

    #[test]
    fn test_fingerprint_matches_openssh() {
        // ssh-keygen -lf reports this fingerprint for KEY_A
        assert_eq!(
            fingerprint(&key(KEY_A)),
            "SHA256:4XnB46/HexrduX6gVMk54rzlqPAimgeLO4fsn/UnZ7c"
        );
    }

    #[test]
    fn test_check_unknown_trusted_changed() {
        let dir = TempDir::new().unwrap();
        let mut known = KnownHosts::load_from(&dir.path().join("known_hosts")).unwrap();
        let a = key(KEY_A);
        let b = key(KEY_B);

        assert_eq!(known.check("bastion", 22, &a), HostKeyStatus::Unknown);

        known.add("bastion", 22, &a);
        assert_eq!(known.check("bastion", 22, &a), HostKeyStatus::Trusted);
        assert_eq!(known.check("bastion", 2222, &a), HostKeyStatus::Unknown);

        match known.check("bastion", 22, &b) {
            HostKeyStatus::Changed {
                stored_fingerprint,
                offered_fingerprint,
                line,
            } => {
                assert_eq!(stored_fingerprint, fingerprint(&a));
                assert_eq!(offered_fingerprint, fingerprint(&b));
                assert_eq!(line, 1);
            }
            other => panic!("expected changed key, got {:?}", other),
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("known_hosts");

        let mut known = KnownHosts::load_from(&path).unwrap();
        known.add("bastion", 2222, &key(KEY_A));
        known.save().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[bastion]:2222 ssh-ed25519 AAAAC3Nza"));

        let reloaded = KnownHosts::load_from(&path).unwrap();
        assert_eq!(reloaded.entries.len(), 1);
        assert_eq!(reloaded.check("bastion", 2222, &key(KEY_A)), HostKeyStatus::Trusted);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let known = KnownHosts::load_from(&dir.path().join("absent")).unwrap();
        assert!(known.entries.is_empty());
    }
}
