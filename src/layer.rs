//! The `Layer` data model: a directory on disk holding a `root/` filesystem tree, a
//! `config.ini`, and an optional `parent` symlink chaining it to the layer underneath.

use std::env;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Error;

/// Default root for layer storage: `$LAYERPATH`, else
/// `$XDG_DATA_HOME/podder`, else `~/.local/share/podder`.
pub fn default_layer_path() -> PathBuf {
    if let Ok(v) = env::var("LAYERPATH") {
        return PathBuf::from(v);
    }
    let data_home = env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| "/root".to_string());
            Path::new(&home).join(".local/share")
        });
    data_home.join("podder")
}

pub struct Layer {
    pub path: PathBuf,
    pub parent: Option<Box<Layer>>,
    config: Config,
}

/// Bound on parent-chain depth while loading layers from disk. The chain is acyclic by
/// construction (parents are written before children), but a corrupt or hand-edited
/// `parent` symlink could loop; this turns that into a clean error instead of a stack
/// overflow.
const MAX_PARENT_DEPTH: usize = 4096;

impl Layer {
    /// Loads (or prepares to create) the layer named `name` under `layerpath`. If an
    /// on-disk `parent` symlink exists and `parent` is `None`, the parent chain is loaded
    /// recursively.
    pub fn open(layerpath: &Path, name: &str, parent: Option<Layer>) -> Result<Self, Error> {
        Self::open_at_depth(layerpath, name, parent, 0)
    }

    fn open_at_depth(layerpath: &Path, name: &str, parent: Option<Layer>, depth: usize) -> Result<Self, Error> {
        if depth > MAX_PARENT_DEPTH {
            return Err(Error::ConfigParse(format!(
                "parent chain exceeds {MAX_PARENT_DEPTH} layers; likely a cycle"
            )));
        }
        let path = layerpath.join(name);
        let mut parent = parent.map(Box::new);

        let parent_link = path.join("parent");
        if parent.is_none() && parent_link.exists() {
            let real = fs::canonicalize(&parent_link)?;
            let parent_name = real
                .file_name()
                .ok_or_else(|| Error::ConfigParse(format!("invalid parent link at {parent_link:?}")))?
                .to_string_lossy()
                .into_owned();
            let parent_dir = real
                .parent()
                .ok_or_else(|| Error::ConfigParse(format!("invalid parent link at {parent_link:?}")))?;
            parent = Some(Box::new(Self::open_at_depth(parent_dir, &parent_name, None, depth + 1)?));
        }

        let config_path = path.join("config.ini");
        let config = if config_path.exists() {
            Config::load(&config_path)?
        } else {
            Config::new()
        };

        Ok(Layer { path, parent, config })
    }

    pub fn pidfile(&self) -> PathBuf {
        self.path.join("init.pid")
    }

    /// All `root/` directories needed to build a namespace with this layer on top,
    /// nearest ancestor first.
    pub fn overlay(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.path.join("root")];
        if let Some(parent) = &self.parent {
            dirs.extend(parent.overlay());
        }
        dirs
    }

    /// Effective value of a scalar key: this layer's own value if set, else the nearest
    /// ancestor's.
    fn effective_scalar(&self, key: &str) -> Option<String> {
        if let Some(v) = self.config.get_scalar(key) {
            return Some(v.to_string());
        }
        self.parent.as_ref().and_then(|p| p.effective_scalar(key))
    }

    /// Effective value of a section: this layer's own entries merged over (i.e.
    /// overriding) the nearest ancestor's, key by key.
    fn effective_section(&self, key: &str) -> Vec<(String, String)> {
        let mut merged = self
            .parent
            .as_ref()
            .map(|p| p.effective_section(key))
            .unwrap_or_default();
        if let Some(own) = self.config.get_section(key) {
            for (k, v) in own {
                if let Some(existing) = merged.iter_mut().find(|(ek, _)| ek == k) {
                    existing.1 = v.clone();
                } else {
                    merged.push((k.clone(), v.clone()));
                }
            }
        }
        merged
    }

    pub fn env(&self) -> Vec<(String, String)> {
        self.effective_section("env")
    }

    pub fn set_env(&mut self, env: Vec<(String, String)>) {
        for (k, v) in env {
            let _ = self.config.set_in_section("env", &k, v);
        }
    }

    pub fn cmd(&self) -> Vec<String> {
        match self.effective_scalar("cmd") {
            Some(v) => shell_split(&v),
            None => Vec::new(),
        }
    }

    pub fn set_cmd(&mut self, cmd: &[String]) {
        let joined = shell_join(cmd);
        let _ = self.config.set_scalar("cmd", joined);
    }

    pub fn hostname(&self) -> String {
        self.effective_scalar("hostname").unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    pub fn domainname(&self) -> String {
        self.effective_scalar("domainname")
            .unwrap_or_else(|| "(none)".to_string())
    }

    pub fn ephemeral(&self) -> bool {
        !matches!(self.effective_scalar("ephemeral").as_deref(), None | Some(""))
    }

    pub fn set_ephemeral(&mut self, value: bool) {
        let _ = self
            .config
            .set_scalar("ephemeral", if value { "yes".to_string() } else { String::new() });
    }

    pub fn url(&self) -> Option<String> {
        self.effective_scalar("url")
    }

    pub fn set_url(&mut self, value: &str) {
        let _ = self.config.set_scalar("url", value.to_string());
    }

    pub fn mac(&self) -> Option<String> {
        self.effective_scalar("mac")
    }

    pub fn ifname(&self) -> Option<String> {
        self.effective_scalar("ifname")
    }

    /// Writes this layer to disk: `merged/`, `root/`, `run/` directories, the `parent`
    /// symlink and `config.ini`. Idempotent; never touches the `root/` tree's contents.
    pub fn write(&self) -> Result<(), Error> {
        for which in ["merged", "root", "run"] {
            fs::create_dir_all(self.path.join(which))?;
        }
        let parent_link = self.path.join("parent");
        if parent_link.symlink_metadata().is_ok() {
            fs::remove_file(&parent_link)?;
        }
        if let Some(parent) = &self.parent {
            symlink(&parent.path, &parent_link)?;
        }
        let config_path = self.path.join("config.ini");
        if config_path.exists() {
            fs::remove_file(&config_path)?;
        }
        self.config.save(&config_path)?;
        Ok(())
    }
}

fn shell_split(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| {
            if p.is_empty() || p.chars().any(|c| c.is_whitespace() || "'\"\\".contains(c)) {
                format!("'{}'", p.replace('\'', "'\\''"))
            } else {
                p.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_defaults_to_basename() {
        let layer = Layer {
            path: PathBuf::from("/data/layers/mybox"),
            parent: None,
            config: Config::new(),
        };
        assert_eq!(layer.hostname(), "mybox");
        assert_eq!(layer.domainname(), "(none)");
        assert!(!layer.ephemeral());
    }

    #[test]
    fn cmd_round_trips_through_shell_quoting() {
        let mut layer = Layer {
            path: PathBuf::from("/data/layers/mybox"),
            parent: None,
            config: Config::new(),
        };
        layer.set_cmd(&["/bin/sh".to_string(), "-c".to_string(), "echo hi there".to_string()]);
        assert_eq!(
            layer.cmd(),
            vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi there".to_string()]
        );
    }

    #[test]
    fn env_merges_with_parent_and_overrides() {
        let mut parent = Layer {
            path: PathBuf::from("/data/layers/base"),
            parent: None,
            config: Config::new(),
        };
        parent.set_env(vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]);

        let mut child = Layer {
            path: PathBuf::from("/data/layers/child"),
            parent: Some(Box::new(parent)),
            config: Config::new(),
        };
        child.set_env(vec![("B".to_string(), "overridden".to_string())]);

        let mut env = child.env();
        env.sort();
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "overridden".to_string())
            ]
        );
    }
}
