//! Everything the ring is used for: discovery and joining, the heartbeat to the ring neighbor,
//! and passing election tokens.

use super::{Route, Server};
use crate::{
    console,
    election::{LeadStep, Step},
    lock,
    transport::Transport,
};
use protocol::{Audience, Command, Envelope, NodeAddress, NodeKind, QuitReason};

impl<T: Transport> Server<T> {
    /// Look for a leader by broadcast and join its cluster. Without an answer after all
    /// attempts, hold an election, which a lone server wins.
    pub fn join_cluster(&self) {
        let attempts = self.config.discovery_attempts;
        for attempt in 1..=attempts {
            match self.transport.discover() {
                Ok(Some(leader)) if leader != self.local => {
                    console::log!("Found leader {leader}, joining");
                    let join = Envelope::unicast(
                        Command::Join {
                            node_type: NodeKind::Server,
                            inform_others: true,
                            address: self.local.clone(),
                            nickname: None,
                        },
                        self.local.clone(),
                    );
                    match self.transport.send(&leader, &join) {
                        Ok(()) => {
                            lock(&self.election).adopt(leader);
                            return;
                        }
                        Err(e) => console::error!(&e, "Joining {leader} failed, searching again"),
                    }
                }
                Ok(_) => console::log!("No leader answered ({attempt}/{attempts})"),
                Err(e) => console::error!(&e, "Discovery attempt {attempt}/{attempts} failed"),
            }
        }
        console::log!("No cluster found");
        self.start_election();
    }

    /// One heartbeat: ping the ring neighbor and handle its failure.
    pub fn heartbeat(&self) {
        let Some(neighbor) = self.neighbor() else {
            return;
        };
        let ping = Envelope::unicast(Command::Ping, self.local.clone());
        let alive = match self.transport.send(&neighbor, &ping) {
            Ok(()) => true,
            Err(e) => {
                console::debug!("Neighbor {neighbor} missed a heartbeat: {e}");
                false
            }
        };
        let failed = lock(&self.detector).record(&neighbor, alive);
        if let Some(failed) = failed {
            self.handle_neighbor_failure(&failed);
        }
    }

    fn handle_neighbor_failure(&self, failed: &NodeAddress) {
        let (removed, neighbor) = {
            let mut directory = lock(&self.directory);
            let removed = directory.remove(NodeKind::Server, failed);
            (removed, directory.neighbor().cloned())
        };
        if !removed {
            return;
        }
        match &neighbor {
            Some(neighbor) => {
                console::warning!("Neighbor {failed} failed, new neighbor is {neighbor}");
            }
            None => console::warning!("Neighbor {failed} failed, no servers left"),
        }

        self.announce(&Command::Quit {
            node_type: NodeKind::Server,
            inform_others: false,
            address: failed.clone(),
            reason: QuitReason::Unreachable,
        });

        let leader_lost = {
            let election = lock(&self.election);
            election.leader().is_none_or(|leader| leader == failed)
        };
        if leader_lost {
            self.start_election();
        }
        self.render();
    }

    pub fn start_election(&self) {
        let neighbor = self.neighbor();
        console::log!("Starting election");
        let step = lock(&self.election).start(neighbor.is_some());
        self.take_step(step, neighbor.as_ref());
    }

    pub(crate) fn handle_vote(&self, candidate: &NodeAddress) {
        let neighbor = self.neighbor();
        let step = lock(&self.election).on_vote(candidate);
        self.take_step(step, neighbor.as_ref());
    }

    fn take_step(&self, step: Step, neighbor: Option<&NodeAddress>) {
        match (step, neighbor) {
            (Step::Forward(candidate), Some(neighbor)) => {
                console::debug!("Passing vote for {candidate} to {neighbor}");
                let vote = Envelope::unicast(
                    Command::Vote {
                        candidate,
                        leader_elected: false,
                    },
                    self.local.clone(),
                );
                if let Err(e) = self.transport.send(neighbor, &vote) {
                    console::error!(&e, "Vote to {neighbor} was lost");
                }
            }
            (Step::Forward(_), None) => {
                // The ring shrank to just us while voting
                lock(&self.election).become_leader();
                self.declare_leadership(None);
            }
            (Step::Elected, neighbor) => self.declare_leadership(neighbor),
            (Step::Ignore, _) => console::debug!("Swallowed a weaker vote"),
        }
    }

    fn declare_leadership(&self, neighbor: Option<&NodeAddress>) {
        console::log!("Elected as leader");
        let lead = Command::Lead {
            leader: self.local.clone(),
        };
        if let Some(neighbor) = neighbor {
            let envelope = Envelope::unicast(lead.clone(), self.local.clone());
            if let Err(e) = self.transport.send(neighbor, &envelope) {
                console::error!(&e, "Lead token to {neighbor} was lost");
            }
        }
        self.multicast(Audience::Clients, lead);
        self.render();
    }

    /// A leader announcement. Ring tokens travel on until every server agrees, multicast
    /// announcements are only adopted.
    pub(crate) fn handle_lead(&self, leader: NodeAddress, route: Route) {
        match route {
            Route::Multicast(_) => {
                if lock(&self.election).adopt(leader.clone()) {
                    console::log!("Leader is now {leader}");
                }
            }
            Route::Unicast => {
                let step = lock(&self.election).on_lead(leader.clone());
                if step == LeadStep::Settled {
                    console::debug!("Lead token completed its round");
                    return;
                }
                console::log!("Leader is now {leader}");
                let (neighbor, known) = {
                    let directory = lock(&self.directory);
                    let known = directory.contains(NodeKind::Server, &leader);
                    (directory.neighbor().cloned(), known)
                };
                // A token for a leader outside our ring would never find its way back
                match neighbor {
                    Some(neighbor) if known && neighbor != leader => {
                        let envelope =
                            Envelope::unicast(Command::Lead { leader }, self.local.clone());
                        if let Err(e) = self.transport.send(&neighbor, &envelope) {
                            console::error!(&e, "Lead token to {neighbor} was lost");
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
