use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::error::*;

const DEFAULT_REPLICAS: usize = 50;

/// First 4 bytes of the MD5 digest, big-endian.
fn default_hash(data: &[u8]) -> u32 {
    let digest = Md5::digest(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A consistent-hash ring over `replicas` virtual nodes per server.
///
/// Not internally locked; [super::MultiServerDiscovery] holds it under its
/// own lock, standalone users synchronize around `&mut`.
pub struct ConsistentHash {
    hash_fn: fn(&[u8]) -> u32,
    replicas: usize,
    /// sorted ring positions
    keys: Vec<u32>,
    hash_to_server: HashMap<u32, String>,
    servers: Vec<String>,
}

impl ConsistentHash {
    pub fn new(replicas: usize, servers: &[String]) -> Self {
        let replicas = if replicas == 0 { DEFAULT_REPLICAS } else { replicas };
        let mut ring = Self {
            hash_fn: default_hash,
            replicas,
            keys: Vec::with_capacity(replicas * servers.len()),
            hash_to_server: HashMap::new(),
            servers: Vec::with_capacity(servers.len()),
        };
        for server in servers {
            let _ = ring.add_server(server);
        }
        ring
    }

    fn virtual_key(&self, server: &str, replica: usize) -> u32 {
        (self.hash_fn)(format!("{}-{}", server, replica).as_bytes())
    }

    pub fn add_server(&mut self, server: &str) -> Result<(), RpcError> {
        if self.servers.iter().any(|s| s == server) {
            return Err(RpcError::Rpc(ERR_DISCOVERY_SERVER_EXISTS));
        }
        for i in 0..self.replicas {
            let hash = self.virtual_key(server, i);
            self.keys.push(hash);
            self.hash_to_server.insert(hash, server.to_string());
        }
        self.keys.sort_unstable();
        self.servers.push(server.to_string());
        Ok(())
    }

    pub fn remove_server(&mut self, server: &str) -> Result<(), RpcError> {
        let pos = match self.servers.iter().position(|s| s == server) {
            Some(pos) => pos,
            None => return Err(RpcError::Rpc(ERR_DISCOVERY_UNKNOWN_SERVER)),
        };
        for i in 0..self.replicas {
            let hash = self.virtual_key(server, i);
            self.hash_to_server.remove(&hash);
        }
        self.keys.clear();
        self.keys.extend(self.hash_to_server.keys().copied());
        self.keys.sort_unstable();
        self.servers.remove(pos);
        Ok(())
    }

    /// Map a key to the server owning the first ring position at or past its
    /// hash, wrapping to the start of the ring.
    pub fn get(&self, key: &str) -> Result<&str, RpcError> {
        if self.keys.is_empty() {
            return Err(RPC_ERR_DISCOVERY_EMPTY);
        }
        let hash = (self.hash_fn)(key.as_bytes());
        let mut idx = self.keys.partition_point(|k| *k < hash);
        if idx == self.keys.len() {
            idx = 0;
        }
        Ok(self.hash_to_server[&self.keys[idx]].as_str())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::collections::HashSet;

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_stable() {
        let ring = ConsistentHash::new(0, &servers(&["tcp@a", "tcp@b", "tcp@c"]));
        for key in ["x", "y", "some-longer-key"] {
            let first = ring.get(key).unwrap().to_string();
            for _ in 0..10 {
                assert_eq!(ring.get(key).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_empty_ring() {
        let ring = ConsistentHash::new(3, &[]);
        assert_eq!(ring.get("k").unwrap_err(), RPC_ERR_DISCOVERY_EMPTY);
    }

    #[test]
    fn test_add_remove() {
        let mut ring = ConsistentHash::new(20, &servers(&["tcp@a", "tcp@b"]));
        assert!(ring.add_server("tcp@a").is_err());
        assert!(ring.remove_server("tcp@nope").is_err());

        let keys: Vec<String> = (0..200).map(|i| format!("key-{}", i)).collect();
        let before: Vec<String> = keys.iter().map(|k| ring.get(k).unwrap().to_string()).collect();

        ring.add_server("tcp@c").unwrap();
        let mut moved = 0;
        for (k, owner) in keys.iter().zip(before.iter()) {
            let now = ring.get(k).unwrap();
            if now != owner {
                // keys only move onto the new server
                assert_eq!(now, "tcp@c");
                moved += 1;
            }
        }
        // roughly a third of the keys move in expectation; allow slack
        assert!(moved > 0 && moved < 150, "moved = {}", moved);

        ring.remove_server("tcp@c").unwrap();
        for (k, owner) in keys.iter().zip(before.iter()) {
            assert_eq!(ring.get(k).unwrap(), owner.as_str());
        }

        let owners: HashSet<String> =
            keys.iter().map(|k| ring.get(k).unwrap().to_string()).collect();
        assert!(owners.len() <= 2);
    }
}
