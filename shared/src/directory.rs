//! Presence directory: every user an endpoint has ever learned about.
//!
//! Users are never removed. Leaving is recorded by flagging the entry as
//! disconnected so that history and resends keep working.

use crate::user::{User, UserId};
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Default)]
pub struct Directory {
    users: HashMap<UserId, User>,
    by_addr: HashMap<SocketAddr, UserId>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user. Returns false without touching the directory if
    /// the id is already present.
    pub fn add(&mut self, user: User) -> bool {
        if self.users.contains_key(&user.id) {
            return false;
        }
        if let Some(addr) = user.addr {
            self.by_addr.insert(addr, user.id);
        }
        self.users.insert(user.id, user);
        true
    }

    pub fn get(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn get_mut(&mut self, id: UserId) -> Option<&mut User> {
        self.users.get_mut(&id)
    }

    pub fn id_for_addr(&self, addr: SocketAddr) -> Option<UserId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<&User> {
        self.id_for_addr(addr).and_then(|id| self.users.get(&id))
    }

    pub fn by_addr_mut(&mut self, addr: SocketAddr) -> Option<&mut User> {
        let id = self.id_for_addr(addr)?;
        self.users.get_mut(&id)
    }

    /// Iterates users in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut User> {
        self.users.values_mut()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
