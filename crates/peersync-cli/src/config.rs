/// Binary configuration from `PEERSYNC_*` environment variables.
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use peersync_crypto::password_digest;
use peersync_transfer::{
    CredentialStore, DEFAULT_PORT, MemoryCredential, SessionConfig, TransferPlan,
};

use crate::credential::FileCredential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Responder: serve the plan to whoever pairs.
    Send,
    /// Initiator: dial the peer and store what it sends.
    Receive,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "send" | "responder" => Ok(Self::Send),
            "receive" | "initiator" => Ok(Self::Receive),
            other => Err(anyhow!("PEERSYNC_ROLE must be send or receive, got {:?}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub peer: Option<String>,
    pub password: Option<String>,
    pub peer_password: Option<String>,
    pub credential_file: Option<PathBuf>,
    pub plan_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub heartbeat: Option<Duration>,
    pub retries: Option<u32>,
}

impl CliConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mode = var("PEERSYNC_ROLE")
            .ok_or_else(|| anyhow!("PEERSYNC_ROLE is not set (send or receive)"))?
            .parse::<Mode>()?;

        Ok(Self {
            mode,
            host: var("PEERSYNC_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var(&var, "PEERSYNC_PORT")?.unwrap_or(DEFAULT_PORT),
            peer: var("PEERSYNC_PEER"),
            password: var("PEERSYNC_PASSWORD"),
            peer_password: var("PEERSYNC_PEER_PASSWORD"),
            credential_file: var("PEERSYNC_CREDENTIAL_FILE").map(PathBuf::from),
            plan_file: var("PEERSYNC_PLAN").map(PathBuf::from),
            output_dir: var("PEERSYNC_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("received")),
            heartbeat: parse_var(&var, "PEERSYNC_HEARTBEAT_SECS")?.map(Duration::from_secs),
            retries: parse_var(&var, "PEERSYNC_RETRIES")?,
        })
    }

    /// Local credential store. A password in the environment (re)sets the
    /// file-backed digest; without one the stored digest is used as is.
    pub fn credential(&self) -> anyhow::Result<Arc<dyn CredentialStore>> {
        match (&self.credential_file, &self.password) {
            (Some(path), password) => {
                Ok(Arc::new(FileCredential::open(path, password.as_deref())?))
            }
            (None, Some(password)) => Ok(Arc::new(MemoryCredential::from_password(password))),
            (None, None) => bail!("set PEERSYNC_PASSWORD or PEERSYNC_CREDENTIAL_FILE"),
        }
    }

    /// Digest expected from the peer. Without a separate peer password the
    /// devices are assumed to share the local one.
    pub fn peer_digest(&self, credential: &dyn CredentialStore) -> anyhow::Result<String> {
        if let Some(password) = &self.peer_password {
            return Ok(password_digest(password));
        }
        credential
            .local_digest()
            .ok_or_else(|| anyhow!("no local password stored; set PEERSYNC_PASSWORD"))
    }

    pub fn session(&self, peer_digest: String) -> anyhow::Result<SessionConfig> {
        let config = match self.mode {
            Mode::Receive => {
                let peer = self
                    .peer
                    .as_deref()
                    .ok_or_else(|| anyhow!("PEERSYNC_PEER is required to receive"))?;
                SessionConfig::initiator(resolve(peer, self.port)?, &self.output_dir, peer_digest)
            }
            Mode::Send => {
                let plan_file = self
                    .plan_file
                    .as_deref()
                    .ok_or_else(|| anyhow!("PEERSYNC_PLAN is required to send"))?;
                let listen: SocketAddr =
                    format!("{}:{}", self.host, self.port).parse().with_context(|| {
                        format!("invalid listen address {}:{}", self.host, self.port)
                    })?;
                SessionConfig::responder(listen, read_plan(plan_file)?, peer_digest)
            }
        };

        let config = match self.heartbeat {
            Some(interval) => config.with_heartbeat_interval(interval),
            None => config,
        };
        Ok(match self.retries {
            Some(retries) => config.with_max_retries(retries),
            None => config,
        })
    }
}

fn parse_var<T, V>(var: &V, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| v.trim().parse::<T>().with_context(|| format!("invalid {}: {:?}", name, v)))
        .transpose()
}

/// `host`, `host:port` or `ip:port`; a bare host gets `default_port`.
fn resolve(peer: &str, default_port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let target =
        if peer.contains(':') { peer.to_string() } else { format!("{}:{}", peer, default_port) };
    target
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve peer {}", target))?
        .next()
        .ok_or_else(|| anyhow!("peer {} resolved to no address", target))
}

pub fn read_plan(path: &Path) -> anyhow::Result<TransferPlan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read plan file {}", path.display()))?;
    Ok(parse_plan(&text))
}

/// One path per line. Blank lines and `#` comments are ignored.
pub fn parse_plan(text: &str) -> TransferPlan {
    TransferPlan::new(
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(PathBuf::from),
    )
}
