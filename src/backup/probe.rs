use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable(String),
}

impl Display for Reachability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Reachable => f.write_str("reachable"),
            Reachability::Unreachable(detail) => write!(f, "unreachable: {detail}"),
        }
    }
}

/// A plain TCP connect against the ssh port, so a host that is down costs one
/// timeout instead of one per job.
#[derive(Clone, Copy, Debug)]
pub struct ConnectivityProbe {
    timeout: Duration,
}

impl ConnectivityProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn check(&self, host: &str, port: u16) -> Reachability {
        tracing::debug!("Probing {host}:{port} (timeout {:?})", self.timeout);
        match timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => Reachability::Reachable,
            Ok(Err(e)) => Reachability::Unreachable(format!("{host}:{port}: {e}")),
            Err(_) => Reachability::Unreachable(format!(
                "{host}:{port}: no answer within {:?}",
                self.timeout
            )),
        }
    }
}
