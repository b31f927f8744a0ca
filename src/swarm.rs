use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::peers::{run_session, CloseReason, PeerAddr, SessionContext};
use crate::prelude::*;

/// every peer address the swarm has heard of and what became of it.
#[derive(Debug)]
pub struct AddressBook {
    queue: VecDeque<PeerAddr>,
    attempts: HashMap<PeerAddr, u32>,
    live: HashSet<PeerAddr>,
    /// peers that failed in a way retrying won't fix.
    banned: HashSet<PeerAddr>,
    max_attempts: u32,
}

impl AddressBook {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            attempts: HashMap::new(),
            live: HashSet::new(),
            banned: HashSet::new(),
            max_attempts,
        }
    }

    fn attempts(&self, addr: &PeerAddr) -> u32 {
        self.attempts.get(addr).copied().unwrap_or(0)
    }

    /// queue `addr` unless it is already queued, live, banned or out of attempts.
    pub fn add(&mut self, addr: PeerAddr) -> bool {
        let known = self.live.contains(&addr)
            || self.banned.contains(&addr)
            || self.queue.contains(&addr)
            || self.attempts(&addr) >= self.max_attempts;
        if !known {
            self.queue.push_back(addr);
        }
        !known
    }

    /// next address to connect to, counted as one attempt.
    pub fn next(&mut self) -> Option<PeerAddr> {
        let addr = self.queue.pop_front()?;
        *self.attempts.entry(addr).or_default() += 1;
        self.live.insert(addr);
        Some(addr)
    }

    pub fn closed(&mut self, addr: PeerAddr, reason: &CloseReason) {
        self.live.remove(&addr);
        match reason {
            CloseReason::Shutdown => {}
            CloseReason::Failed(_) if !reason.is_retryable() => {
                info!(%addr, "not retrying peer");
                self.banned.insert(addr);
            }
            CloseReason::Failed(_) => {
                self.add(addr);
            }
        }
    }

    pub fn n_queued(&self) -> usize {
        self.queue.len()
    }
}

/// keeps up to `max_peers` sessions running until every piece is verified.
#[derive(Debug)]
pub struct Swarm {
    ctx: SessionContext,
    book: AddressBook,
    sessions: JoinSet<(PeerAddr, CloseReason)>,
    addr_rx: mpsc::Receiver<Vec<PeerAddr>>,
}

impl Swarm {
    pub fn new(ctx: SessionContext, addr_rx: mpsc::Receiver<Vec<PeerAddr>>) -> Self {
        let book = AddressBook::new(ctx.config.max_connect_attempts);
        Self {
            ctx,
            book,
            sessions: JoinSet::new(),
            addr_rx,
        }
    }

    fn spawn_sessions(&mut self) {
        while self.sessions.len() < self.ctx.config.max_peers {
            let Some(addr) = self.book.next() else {
                break;
            };
            debug!(%addr, "starting session");
            let ctx = self.ctx.clone();
            self.sessions
                .spawn(async move { (addr, run_session(addr, ctx).await) });
        }
    }

    /// run until the download completes. errors when there is nobody left to download from.
    #[instrument(name = "swarm", level = "info", skip_all)]
    pub async fn run(mut self, initial: Vec<PeerAddr>) -> anyhow::Result<()> {
        if initial.is_empty() {
            anyhow::bail!("no peers to download from");
        }
        initial.into_iter().for_each(|addr| {
            self.book.add(addr);
        });

        let picker = self.ctx.picker.clone();
        let complete = picker.wait_complete();
        tokio::pin!(complete);

        let result = loop {
            if picker.is_complete() {
                break Ok(());
            }

            self.spawn_sessions();
            if self.sessions.is_empty() {
                break Err(anyhow::anyhow!(
                    "swarm exhausted with {:?} downloaded",
                    picker.progress()
                ));
            }

            tokio::select! {
                _ = &mut complete => {
                    info!("download complete");
                    break Ok(());
                }

                Some(joined) = self.sessions.join_next() => match joined {
                    Ok((addr, reason)) => {
                        debug!(%addr, %reason, "session ended");
                        self.book.closed(addr, &reason);
                    }
                    Err(err) => error!("session task failed: {}", err),
                },

                Some(addrs) = self.addr_rx.recv() => {
                    let n_new = addrs
                        .into_iter()
                        .filter(|addr| self.book.add(*addr))
                        .count();
                    debug!(n_new, n_queued = self.book.n_queued(), "tracker sent peers");
                }
            }
        };

        self.ctx.shutdown.cancel();
        while let Some(joined) = self.sessions.join_next().await {
            if let Err(err) = joined {
                error!("session task failed: {}", err);
            }
        }
        result
    }
}
