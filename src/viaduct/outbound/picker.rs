use std::sync::atomic::{AtomicUsize, Ordering};

use rand::RngExt;

use crate::viaduct::net::Destination;
use crate::viaduct::outbound::OutboundError;

/// One credential accepted by an upstream proxy.
#[derive(Debug, Clone)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
    pub level: u32,
}

/// An upstream proxy server: destination plus its accepted credentials.
///
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub dest: Destination,
    pub users: Vec<UserCredential>,
}

impl ServerSpec {
    pub fn new(dest: Destination, users: Vec<UserCredential>) -> Self {
        Self { dest, users }
    }

    /// Pick one of the server's credentials, `None` when it has none.
    pub fn pick_user(&self) -> Option<&UserCredential> {
        match self.users.len() {
            0 => None,
            1 => self.users.first(),
            n => self.users.get(rand::rng().random_range(0..n)),
        }
    }
}

/// Round-robin picker over the configured upstream pool.
pub struct ServerPicker {
    servers: Vec<ServerSpec>,
    next: AtomicUsize,
}

impl ServerPicker {
    pub fn new(servers: Vec<ServerSpec>) -> Result<Self, OutboundError> {
        if servers.is_empty() {
            return Err(OutboundError::NoServer);
        }
        Ok(Self {
            servers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn pick(&self) -> &ServerSpec {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        &self.servers[i]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn pool(n: usize) -> Vec<ServerSpec> {
        (0..n)
            .map(|i| ServerSpec::new(Destination::tcp(format!("proxy{i}"), 3128), vec![]))
            .collect()
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            ServerPicker::new(vec![]),
            Err(OutboundError::NoServer)
        ));
    }

    #[test]
    fn round_robin_is_fair() {
        let picker = ServerPicker::new(pool(3)).unwrap();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let k = 10;
        for _ in 0..k {
            *counts.entry(picker.pick().dest.host.clone()).or_default() += 1;
        }
        // Each server is picked floor(K/N) or ceil(K/N) times.
        for i in 0..3 {
            let c = counts[&format!("proxy{i}")];
            assert!(c == k / 3 || c == k / 3 + 1, "proxy{i} picked {c} times");
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let picker = ServerPicker::new(pool(2)).unwrap();
        assert_eq!(picker.pick().dest.host, "proxy0");
        assert_eq!(picker.pick().dest.host, "proxy1");
        assert_eq!(picker.pick().dest.host, "proxy0");
    }

    #[test]
    fn pick_user_honors_pool() {
        let no_users = ServerSpec::new(Destination::tcp("p", 1), vec![]);
        assert!(no_users.pick_user().is_none());

        let users = vec![
            UserCredential {
                username: "a".into(),
                password: "".into(),
                level: 1,
            },
            UserCredential {
                username: "b".into(),
                password: "".into(),
                level: 2,
            },
        ];
        let spec = ServerSpec::new(Destination::tcp("p", 1), users);
        for _ in 0..20 {
            let u = spec.pick_user().unwrap();
            assert!(u.username == "a" || u.username == "b");
        }
    }
}
