use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tokio::fs;

/// Length of the persisted proxy run id, in hex characters.
pub const RUN_ID_LEN: usize = 40;

/// The line-oriented proxy configuration file:
///
/// ```text
/// port 36379
/// proxy myid c0ffee...
/// proxy router 127.0.0.1 7000 4
/// proxy auth-pass 127.0.0.1 7000 secret
/// ```
///
/// The proxy rewrites this file itself whenever the instance set or an
/// auth password changes, so parsing and rendering must round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub port: Option<u16>,
    pub myid: Option<String>,
    pub routers: Vec<RouterConfig>,
    pub auth_passes: Vec<AuthPassConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub poolsize: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPassConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl ProxyConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut config = Self::default();
        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            parse_line(&mut config, &fields)
                .with_context(|| format!("bad directive on line {}: {line}", number + 1))?;
        }
        Ok(config)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.routers.is_empty() {
            bail!("configuration must declare at least one 'proxy router'");
        }
        Ok(())
    }

    /// Canonical file content; `parse(render(c)) == c`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(port) = self.port {
            out.push_str(&format!("port {port}\n"));
        }
        if let Some(myid) = &self.myid {
            out.push_str(&format!("proxy myid {myid}\n"));
        }
        for router in &self.routers {
            out.push_str(&format!(
                "proxy router {} {} {}\n",
                router.host, router.port, router.poolsize
            ));
        }
        for auth in &self.auth_passes {
            out.push_str(&format!(
                "proxy auth-pass {} {} {}\n",
                auth.host, auth.port, auth.password
            ));
        }
        out
    }

    pub fn auth_for(&self, host: &str, port: u16) -> Option<&str> {
        self.auth_passes
            .iter()
            .find(|auth| auth.host == host && auth.port == port)
            .map(|auth| auth.password.as_str())
    }
}

fn parse_line(config: &mut ProxyConfig, fields: &[&str]) -> Result<()> {
    match fields[0] {
        "port" => {
            if fields.len() != 2 {
                bail!("port takes exactly one argument");
            }
            config.port = Some(fields[1].parse().context("invalid port number")?);
        }
        "proxy" => parse_proxy_line(config, &fields[1..])?,
        other => bail!("unrecognized configuration directive '{other}'"),
    }
    Ok(())
}

fn parse_proxy_line(config: &mut ProxyConfig, fields: &[&str]) -> Result<()> {
    match fields.first().copied() {
        Some("myid") if fields.len() == 2 => {
            if fields[1].len() != RUN_ID_LEN {
                bail!("malformed proxy id in myid option");
            }
            config.myid = Some(fields[1].to_string());
        }
        Some("router") if fields.len() == 3 || fields.len() == 4 => {
            let port = fields[2].parse::<u16>().context("invalid router port")?;
            let poolsize = match fields.get(3) {
                Some(raw) => {
                    let poolsize = raw.parse::<usize>().context("invalid router poolsize")?;
                    if poolsize == 0 {
                        bail!("router poolsize must be 1 or greater");
                    }
                    poolsize
                }
                None => 1,
            };
            config.routers.push(RouterConfig {
                host: fields[1].to_string(),
                port,
                poolsize,
            });
        }
        Some("auth-pass") if fields.len() == 4 => {
            let port = fields[2].parse::<u16>().context("invalid auth-pass port")?;
            config.auth_passes.push(AuthPassConfig {
                host: fields[1].to_string(),
                port,
                password: fields[3].to_string(),
            });
        }
        _ => bail!("unrecognized proxy configuration statement"),
    }
    Ok(())
}

/// Owns the config file path and performs atomic rewrites.
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The proxy persists its own state into the config file, so a
    /// missing or read-only file is a startup error.
    pub fn ensure_writable(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.path)
            .with_context(|| format!("config file {} does not exist", self.path.display()))?;
        if metadata.permissions().readonly() {
            return Err(anyhow!(
                "config file {} is not writable",
                self.path.display()
            ));
        }
        Ok(())
    }

    /// Write the new content beside the file, fsync it, then rename into
    /// place so a crash never leaves a torn config behind.
    pub async fn rewrite(&self, config: &ProxyConfig) -> Result<()> {
        let tmp = self.path.with_extension("rewrite");
        fs::write(&tmp, config.render())
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        let file = fs::File::open(&tmp)
            .await
            .with_context(|| format!("failed to reopen {}", tmp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("failed to fsync {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# proxy config
port 36380

proxy myid 0123456789abcdef0123456789abcdef01234567
proxy router 127.0.0.1 7000 4
proxy router 127.0.0.1 7001
proxy auth-pass 127.0.0.1 7000 hunter2
";

    #[test]
    fn parses_sample_config() {
        let config = ProxyConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.port, Some(36380));
        assert_eq!(
            config.myid.as_deref(),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
        assert_eq!(config.routers.len(), 2);
        assert_eq!(config.routers[0].poolsize, 4);
        assert_eq!(config.routers[1].poolsize, 1);
        assert_eq!(config.auth_for("127.0.0.1", 7000), Some("hunter2"));
        assert_eq!(config.auth_for("127.0.0.1", 7001), None);
        config.ensure_valid().unwrap();
    }

    #[test]
    fn render_then_parse_round_trips() {
        let config = ProxyConfig::parse(SAMPLE).unwrap();
        let reparsed = ProxyConfig::parse(&config.render()).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn rejects_malformed_directives() {
        assert!(ProxyConfig::parse("proxy myid tooshort").is_err());
        assert!(ProxyConfig::parse("proxy router 127.0.0.1").is_err());
        assert!(ProxyConfig::parse("proxy router 127.0.0.1 7000 0").is_err());
        assert!(ProxyConfig::parse("proxy frobnicate on").is_err());
        assert!(ProxyConfig::parse("unknown 1").is_err());
    }

    #[test]
    fn empty_router_list_is_invalid() {
        let config = ProxyConfig::parse("port 36379\n").unwrap();
        assert!(config.ensure_valid().is_err());
    }

    #[tokio::test]
    async fn rewrite_replaces_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.conf");
        std::fs::write(&path, "proxy router 127.0.0.1 7000\n").unwrap();

        let manager = ConfigManager::new(&path);
        manager.ensure_writable().unwrap();

        let mut config = ProxyConfig::load(&path).await.unwrap();
        config.myid = Some("f".repeat(RUN_ID_LEN));
        manager.rewrite(&config).await.unwrap();

        let reloaded = ProxyConfig::load(&path).await.unwrap();
        assert_eq!(reloaded, config);
        assert!(!path.with_extension("rewrite").exists());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let manager = ConfigManager::new("/nonexistent/proxy.conf");
        assert!(manager.ensure_writable().is_err());
    }
}
