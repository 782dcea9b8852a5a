//! Resource/token management: the per-resource registration that
//! serializes lease operations, the acquire/release command bodies, and
//! client-death cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moorlock_error::{MoorError, Result};
use moorlock_io::traits::DiskHandle;
use moorlock_paxos::Token;
use moorlock_types::{
    AcquireFlags, ClientDump, DaemonDump, LockspaceSpec, Name, ResourceSpec, TokenDump,
    TokenFlags,
};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::client::{CmdKind, HeldToken};
use crate::space::{renewal_thread, Space, SpacePhase};
use crate::Core;

/// Registration of one resource within this process.
///
/// The entry exists from before the acquire's first disk op until after
/// the release's last one, so overlapping operations on the same resource
/// serialize through registration alone and no lock is ever held across
/// disk I/O.
struct ResourceEntry {
    pid: i32,
    token_id: u64,
}

#[derive(Default)]
pub struct ResourceTable {
    inner: Mutex<HashMap<(Name, Name), ResourceEntry>>,
}

impl ResourceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, key: (Name, Name), pid: i32, token_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(&key) {
            return Err(MoorError::ResourceBusy {
                pid: existing.pid,
                space_name: key.0,
                resource_name: key.1,
            });
        }
        inner.insert(key, ResourceEntry { pid, token_id });
        Ok(())
    }

    fn remove(&self, key: &(Name, Name), token_id: u64) {
        let mut inner = self.inner.lock();
        if inner.get(key).is_some_and(|e| e.token_id == token_id) {
            inner.remove(key);
        }
    }
}

impl Core {
    // === Lockspace commands ===

    pub(crate) fn add_lockspace(self: &Arc<Self>, spec: LockspaceSpec) -> Result<()> {
        if spec.host_id == 0 {
            return Err(MoorError::LeaderNumHosts {
                num_hosts: 0,
                host_id: 0,
            });
        }
        let disk = self.opener.open(&spec.disk)?;
        let timeouts = self.timeouts_for(spec.io_timeout_seconds);
        let watchdog = self.watchdog.connect(&spec.name, spec.host_id)?;
        let space_id = self.next_space_id();

        let space = Space::new(
            space_id,
            spec.name,
            spec.host_id,
            self.config.host_name,
            spec.disk.clone(),
            disk,
            timeouts,
            watchdog,
        );
        self.events.push(format!(
            "lockspace {} host_id {} has space_id {}",
            spec.name, spec.host_id, space_id
        ));

        self.spaces.reserve(&space)?;

        let thread_space = Arc::clone(&space);
        let io = self.io.clone();
        let clock = Arc::clone(&self.clock);
        let thread = std::thread::Builder::new()
            .name(format!("moorlock-space-{space_id}"))
            .spawn(move || {
                let delta = moorlock_delta::DeltaEngine::new(io, Arc::clone(&clock));
                renewal_thread(&thread_space, &delta, &clock);
            })
            .expect("spawn renewal thread");
        self.spaces.register_thread(space_id, thread);

        // Block until the host slot is held (or the acquire failed).
        let start_error = {
            let mut st = space.status.lock();
            while st.phase == SpacePhase::Starting {
                space.cond.wait(&mut st);
            }
            match st.phase {
                SpacePhase::Stopped => Some(st.start_error.take()),
                _ => None,
            }
        };
        if let Some(error) = start_error {
            self.spaces.abort_insert(&space);
            return Err(error.unwrap_or(MoorError::SpaceNotFound(spec.name)));
        }
        Ok(())
    }

    pub(crate) fn rem_lockspace(&self, name: Name) -> Result<()> {
        let space = self
            .spaces
            .get(&name)
            .ok_or(MoorError::SpaceNotFound(name))?;
        space.status.lock().external_remove = true;

        // The supervisor fences clients and tears the space down; wait for
        // it to vanish.
        while self.spaces.get(&name).is_some() {
            std::thread::sleep(Duration::from_millis(100));
        }
        self.spaces.reap();
        Ok(())
    }

    // === Acquire ===

    pub(crate) fn acquire_cmd(
        self: &Arc<Self>,
        pid: i32,
        resources: Vec<ResourceSpec>,
        flags: AcquireFlags,
    ) -> Result<()> {
        if resources.len() > moorlock_types::MAX_RESOURCES {
            return Err(MoorError::TooManyResources {
                max: moorlock_types::MAX_RESOURCES,
            });
        }
        let client = self.clients.set_cmd_active(pid, CmdKind::Acquire)?;
        let result = self.do_acquire(pid, &client, resources, flags);

        let pid_dead = {
            let mut slot = client.lock();
            slot.cmd_active = None;
            slot.pid_dead
        };
        if pid_dead {
            // The process died while we worked; everything it holds (old
            // and newly acquired) goes to the async release worker.
            let taken = client.lock().take_all_tokens();
            for held in taken {
                self.release_async(held);
            }
            self.clients.remove(pid);
            return Err(MoorError::ClientNotFound(pid));
        }
        result
    }

    fn do_acquire(
        self: &Arc<Self>,
        pid: i32,
        client: &Arc<Mutex<crate::client::ClientSlot>>,
        resources: Vec<ResourceSpec>,
        flags: AcquireFlags,
    ) -> Result<()> {
        // Skip resources this client already holds (idempotent acquire);
        // verify slot capacity for the rest.
        let mut todo: Vec<ResourceSpec> = Vec::new();
        {
            let slot = client.lock();
            for spec in resources {
                if slot.find_token(&spec.space_name, &spec.name).is_none() {
                    todo.push(spec);
                }
            }
            if slot.empty_slots() < todo.len() {
                return Err(MoorError::NoFreeSlots);
            }
        }
        if todo.is_empty() {
            return Ok(());
        }

        // Snapshot lockspace identity for every requested resource.
        let mut staged: Vec<(ResourceSpec, Arc<Space>, u64)> = Vec::new();
        for spec in todo {
            let space = self
                .spaces
                .get(&spec.space_name)
                .ok_or(MoorError::SpaceNotFound(spec.space_name))?;
            let (generation, healthy) = space.acquire_snapshot();
            if !healthy {
                return Err(MoorError::SpaceFailing(spec.space_name));
            }
            staged.push((spec, space, generation));
        }

        let mut acquired: Vec<HeldToken> = Vec::new();
        let mut registered: Vec<((Name, Name), u64)> = Vec::new();

        let result = (|| -> Result<()> {
            for (spec, space, generation) in &staged {
                let token_id = self.next_token_id();
                let key = (spec.space_name, spec.name);
                self.resources.add(key, pid, token_id)?;
                registered.push((key, token_id));
                self.events.push(format!(
                    "resource {}:{} has token_id {} for pid {}",
                    spec.space_name, spec.name, token_id, pid
                ));

                let mut disks: Vec<DiskHandle> = Vec::new();
                for disk_spec in &spec.disks {
                    match self.opener.open(disk_spec) {
                        Ok(disk) => disks.push(disk),
                        Err(e) => {
                            warn!(path = %disk_spec.path.display(), error = %e, "disk open failed");
                        }
                    }
                }
                if !moorlock_paxos::majority_disks(spec.disks.len(), disks.len()) {
                    return Err(MoorError::LeaderRead);
                }

                let mut token = Token {
                    token_id,
                    space_name: spec.space_name,
                    resource_name: spec.name,
                    host_id: space.host_id,
                    host_generation: *generation,
                    io_timeout: space.timeouts.io_timeout_seconds(),
                    disks,
                    flags: TokenFlags::empty(),
                };

                let acquire_result = self.paxos.acquire(
                    &mut token,
                    self.as_ref(),
                    flags,
                    spec.acquire_lver,
                    spec.new_num_hosts,
                );

                match acquire_result {
                    Ok((leader, _dblock)) => acquired.push(HeldToken {
                        token,
                        leader,
                        shared: flags.contains(AcquireFlags::SHARED),
                    }),
                    Err(e) => {
                        if token.flags.contains(TokenFlags::RETRACT_PAXOS) {
                            // We may own the lease on disk without knowing;
                            // make sure we do not.
                            let _ = self.paxos.release(&token, None);
                        }
                        return Err(e);
                    }
                }
            }

            // The lockspace may have failed while the ballots ran; tokens
            // acquired under a stale generation are invalid.
            for (spec, space, generation) in &staged {
                let (current_generation, healthy) = space.acquire_snapshot();
                if !healthy || current_generation != *generation {
                    warn!(space = %spec.space_name, "lockspace changed during acquire");
                    return Err(MoorError::SpaceFailing(spec.space_name));
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                let mut slot = client.lock();
                for held in acquired {
                    slot.insert_token(held).expect("slot capacity pre-checked");
                }
                Ok(())
            }
            Err(e) => {
                for held in acquired {
                    self.release_token_logged(held);
                }
                for (key, token_id) in registered {
                    self.resources.remove(&key, token_id);
                }
                Err(e)
            }
        }
    }

    // === Release ===

    pub(crate) fn release_cmd(
        &self,
        pid: i32,
        which: Option<Vec<(Name, Name)>>,
    ) -> Result<()> {
        let client = self.clients.set_cmd_active(pid, CmdKind::Release)?;
        let result = self.do_release(&client, which);
        self.clients.clear_cmd_active(&client);
        result
    }

    fn do_release(
        &self,
        client: &Arc<Mutex<crate::client::ClientSlot>>,
        which: Option<Vec<(Name, Name)>>,
    ) -> Result<()> {
        let to_release: Vec<HeldToken> = {
            let mut slot = client.lock();
            match which {
                None => slot.take_all_tokens(),
                Some(keys) => {
                    let mut out = Vec::new();
                    for (space_name, resource_name) in keys {
                        let index = slot.find_token(&space_name, &resource_name).ok_or(
                            MoorError::TokenNotFound {
                                pid: slot.pid,
                                space_name,
                                resource_name,
                            },
                        )?;
                        out.push(slot.tokens[index].take().expect("index from find_token"));
                    }
                    out
                }
            }
        };

        let mut first_error = None;
        for held in to_release {
            if let Err(e) = self.release_token(held) {
                warn!(error = %e, "release failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Release one token on disk and drop its resource registration.
    pub(crate) fn release_token(&self, held: HeldToken) -> Result<()> {
        let key = (held.token.space_name, held.token.resource_name);

        let result = if held.shared {
            self.paxos.release_shared(&held.token)
        } else if held.token.flags.contains(TokenFlags::RETRACT_PAXOS) {
            // Partial ballot: clear our ownership if it exists, tolerating
            // "not the owner" outcomes.
            match self.paxos.release(&held.token, None) {
                Ok(_) => Ok(()),
                Err(MoorError::ReleaseOwner { .. } | MoorError::ReleaseLver { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            self.paxos.release(&held.token, Some(&held.leader)).map(drop)
        };

        self.resources.remove(&key, held.token.token_id);
        result
    }

    pub(crate) fn release_token_logged(&self, held: HeldToken) {
        let token_id = held.token.token_id;
        if let Err(e) = self.release_token(held) {
            warn!(token_id, error = %e, "async release failed");
        }
    }

    // === Client lifecycle ===

    pub(crate) fn client_gone_cmd(&self, pid: i32) -> Result<()> {
        let client = self
            .clients
            .get(pid)
            .ok_or(MoorError::ClientNotFound(pid))?;

        let defer = {
            let mut slot = client.lock();
            slot.pid_dead = true;
            slot.cmd_active == Some(CmdKind::Acquire)
        };
        if defer {
            // The in-flight acquire completes first, then releases
            // everything (old and new) itself.
            info!(pid, "client died mid-acquire; release deferred");
            return Ok(());
        }

        let taken = client.lock().take_all_tokens();
        for held in taken {
            self.release_async(held);
        }
        self.clients.remove(pid);
        info!(pid, "client removed");
        Ok(())
    }

    // === Dumps ===

    pub(crate) fn inquire_cmd(&self, pid: i32) -> Result<Vec<TokenDump>> {
        let client = self
            .clients
            .get(pid)
            .ok_or(MoorError::ClientNotFound(pid))?;
        let slot = client.lock();
        Ok(slot
            .tokens
            .iter()
            .flatten()
            .map(|held| TokenDump {
                token_id: held.token.token_id,
                space_name: held.token.space_name,
                resource_name: held.token.resource_name,
                lver: held.leader.lver,
                owner_id: held.leader.owner_id,
                owner_generation: held.leader.owner_generation,
                timestamp: held.leader.timestamp,
                shared: held.shared,
            })
            .collect())
    }

    pub(crate) fn status_cmd(&self) -> DaemonDump {
        let timeouts = self.timeouts_for(0);
        DaemonDump {
            io_timeout_seconds: timeouts.io_timeout_seconds(),
            renewal_seconds: timeouts.renewal_seconds(),
            renewal_fail_seconds: timeouts.renewal_fail_seconds(),
            host_dead_seconds: timeouts.host_dead_seconds(),
            spaces: self.spaces.all().iter().map(|s| s.dump()).collect(),
            clients: self
                .clients
                .all()
                .iter()
                .map(|c| {
                    let slot = c.lock();
                    ClientDump {
                        pid: slot.pid,
                        cmd_active: slot.cmd_active.is_some(),
                        pid_dead: slot.pid_dead,
                        tokens: slot
                            .tokens
                            .iter()
                            .flatten()
                            .map(|held| TokenDump {
                                token_id: held.token.token_id,
                                space_name: held.token.space_name,
                                resource_name: held.token.resource_name,
                                lver: held.leader.lver,
                                owner_id: held.leader.owner_id,
                                owner_generation: held.leader.owner_generation,
                                timestamp: held.leader.timestamp,
                                shared: held.shared,
                            })
                            .collect(),
                    }
                })
                .collect(),
        }
    }
}
