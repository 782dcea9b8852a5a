//! Registered-client table.
//!
//! A client is a local process (pid) that holds tokens. Slot state is a
//! tagged enum rather than callback pointers: the supervisor dispatches on
//! what the client *is*, and per-slot mutexes coordinate the supervisor
//! with the worker that owns an in-flight command.

use std::collections::HashMap;
use std::sync::Arc;

use moorlock_error::{MoorError, Result};
use moorlock_ondisk::LeaderRecord;
use moorlock_paxos::Token;
use moorlock_types::{Name, MAX_RESOURCES};
use parking_lot::Mutex;

/// Command classes that serialize per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Acquire,
    Release,
    Inquire,
}

/// A token a client holds, with the leader state from its acquire.
pub struct HeldToken {
    pub token: Token,
    pub leader: LeaderRecord,
    pub shared: bool,
}

/// One registered client.
pub struct ClientSlot {
    pub pid: i32,
    /// The command currently running on this client's behalf, if any.
    pub cmd_active: Option<CmdKind>,
    /// The process died; tokens must be released and the slot dropped.
    pub pid_dead: bool,
    /// Fencing signals already sent to this pid.
    pub killing: u8,
    pub tokens: Vec<Option<HeldToken>>,
}

impl ClientSlot {
    fn new(pid: i32) -> Self {
        Self {
            pid,
            cmd_active: None,
            pid_dead: false,
            killing: 0,
            tokens: (0..MAX_RESOURCES).map(|_| None).collect(),
        }
    }

    /// Count of unoccupied token slots.
    #[must_use]
    pub fn empty_slots(&self) -> usize {
        self.tokens.iter().filter(|t| t.is_none()).count()
    }

    /// Find a held token by resource identity.
    #[must_use]
    pub fn find_token(&self, space_name: &Name, resource_name: &Name) -> Option<usize> {
        self.tokens.iter().position(|slot| {
            slot.as_ref().is_some_and(|held| {
                held.token.space_name == *space_name && held.token.resource_name == *resource_name
            })
        })
    }

    /// True when any held token belongs to `space_name`.
    #[must_use]
    pub fn uses_space(&self, space_name: &Name) -> bool {
        self.tokens.iter().any(|slot| {
            slot.as_ref()
                .is_some_and(|held| held.token.space_name == *space_name)
        })
    }

    /// Store a token in the first free slot.
    pub fn insert_token(&mut self, held: HeldToken) -> Result<()> {
        for slot in &mut self.tokens {
            if slot.is_none() {
                *slot = Some(held);
                return Ok(());
            }
        }
        Err(MoorError::NoFreeSlots)
    }

    /// Remove and return every held token.
    pub fn take_all_tokens(&mut self) -> Vec<HeldToken> {
        self.tokens.iter_mut().filter_map(Option::take).collect()
    }
}

/// All registered clients, keyed by pid.
#[derive(Default)]
pub struct ClientTable {
    inner: Mutex<HashMap<i32, Arc<Mutex<ClientSlot>>>>,
}

impl ClientTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&pid) {
            return Err(MoorError::Busy);
        }
        inner.insert(pid, Arc::new(Mutex::new(ClientSlot::new(pid))));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, pid: i32) -> Option<Arc<Mutex<ClientSlot>>> {
        self.inner.lock().get(&pid).cloned()
    }

    pub fn remove(&self, pid: i32) {
        self.inner.lock().remove(&pid);
    }

    /// Snapshot of every client slot handle.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Mutex<ClientSlot>>> {
        self.inner.lock().values().cloned().collect()
    }

    /// Pids of live clients holding tokens in `space_name`.
    #[must_use]
    pub fn pids_using_space(&self, space_name: &Name) -> Vec<i32> {
        self.all()
            .into_iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                (slot.uses_space(space_name)).then_some(slot.pid)
            })
            .collect()
    }

    /// Mark a command active on the client; rejects concurrent commands.
    pub fn set_cmd_active(&self, pid: i32, cmd: CmdKind) -> Result<Arc<Mutex<ClientSlot>>> {
        let slot = self.get(pid).ok_or(MoorError::ClientNotFound(pid))?;
        {
            let mut guard = slot.lock();
            if guard.pid_dead {
                return Err(MoorError::ClientNotFound(pid));
            }
            if guard.cmd_active.is_some() {
                return Err(MoorError::Busy);
            }
            guard.cmd_active = Some(cmd);
        }
        Ok(slot)
    }

    pub fn clear_cmd_active(&self, slot: &Arc<Mutex<ClientSlot>>) {
        slot.lock().cmd_active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_busy_rules() {
        let table = ClientTable::new();
        table.register(100).unwrap();
        assert!(matches!(table.register(100), Err(MoorError::Busy)));

        let slot = table.set_cmd_active(100, CmdKind::Acquire).unwrap();
        assert!(matches!(
            table.set_cmd_active(100, CmdKind::Release),
            Err(MoorError::Busy)
        ));
        table.clear_cmd_active(&slot);
        table.set_cmd_active(100, CmdKind::Release).unwrap();
    }

    #[test]
    fn unknown_pid_is_not_found() {
        let table = ClientTable::new();
        assert!(matches!(
            table.set_cmd_active(1, CmdKind::Inquire),
            Err(MoorError::ClientNotFound(1))
        ));
    }
}
