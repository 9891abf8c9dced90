//! # Ring Election
//!
//! Leader election in the style of Le Lann, Chang and Roberts. A vote token circulates
//! along the ring of servers, each server forwards the better of its own address and the
//! token's candidate. The server that receives its own address as candidate is elected,
//! and then circulates a lead token so that everyone adopts it.
//!
//! This module only holds the state machine. Sending the tokens is up to the caller.

use protocol::NodeAddress;
use serde::Deserialize;
use std::fmt::Display;

/// Which address wins an election
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElectionRule {
    /// The greatest address wins
    #[default]
    Max,
    /// The smallest address wins
    Min,
}

impl ElectionRule {
    /// Whether `a` wins against `b`
    #[must_use]
    pub fn beats(self, a: &NodeAddress, b: &NodeAddress) -> bool {
        match self {
            ElectionRule::Max => a > b,
            ElectionRule::Min => a < b,
        }
    }

    #[must_use]
    pub fn pick<'a>(self, a: &'a NodeAddress, b: &'a NodeAddress) -> &'a NodeAddress {
        if self.beats(b, a) {
            b
        } else {
            a
        }
    }
}

/// What the caller has to do after feeding a vote to the state machine
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Send a vote for this candidate to the ring neighbor
    Forward(NodeAddress),
    /// We won, announce the leadership
    Elected,
    /// The token is swallowed, a better one is already circulating
    Ignore,
}

/// What the caller has to do after a lead token arrived
#[derive(Debug, PartialEq, Eq)]
pub enum LeadStep {
    /// Leader adopted, pass the token on unless the neighbor is the leader
    Forward,
    /// Our own token came back, it has completed its round
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Voting,
    Leaderless,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self {
            Role::Leader => "Leader",
            Role::Follower => "Follower",
            Role::Voting => "Waiting for election",
            Role::Leaderless => "No leader",
        };
        write!(f, "{role}")
    }
}

#[derive(Debug)]
pub struct Election {
    local: NodeAddress,
    rule: ElectionRule,
    voting: bool,
    candidate: Option<NodeAddress>,
    leader: Option<NodeAddress>,
}

impl Election {
    #[must_use]
    pub fn new(local: NodeAddress, rule: ElectionRule) -> Self {
        Self {
            local,
            rule,
            voting: false,
            candidate: None,
            leader: None,
        }
    }

    #[must_use]
    pub fn leader(&self) -> Option<&NodeAddress> {
        self.leader.as_ref()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.as_ref() == Some(&self.local)
    }

    #[must_use]
    pub fn is_voting(&self) -> bool {
        self.voting
    }

    #[must_use]
    pub fn role(&self) -> Role {
        match &self.leader {
            _ if self.voting => Role::Voting,
            Some(leader) if *leader == self.local => Role::Leader,
            Some(_) => Role::Follower,
            None => Role::Leaderless,
        }
    }

    /// Start an election with ourselves as candidate.
    ///
    /// Without a neighbor we are the only server, and elected right away.
    pub fn start(&mut self, has_neighbor: bool) -> Step {
        self.leader = None;
        if !has_neighbor {
            self.become_leader();
            return Step::Elected;
        }
        self.voting = true;
        self.candidate = Some(self.local.clone());
        Step::Forward(self.local.clone())
    }

    pub fn on_vote(&mut self, candidate: &NodeAddress) -> Step {
        if *candidate == self.local {
            self.become_leader();
            return Step::Elected;
        }

        let winner = self.rule.pick(&self.local, candidate).clone();
        if self.voting {
            if let Some(pending) = &self.candidate {
                if !self.rule.beats(&winner, pending) {
                    return Step::Ignore;
                }
            }
        }
        self.voting = true;
        self.candidate = Some(winner.clone());
        Step::Forward(winner)
    }

    /// A lead token circulating on the ring.
    ///
    /// The token has to pass every server, servers further along may still be voting even
    /// when this one already agrees.
    pub fn on_lead(&mut self, leader: NodeAddress) -> LeadStep {
        if leader == self.local {
            self.become_leader();
            return LeadStep::Settled;
        }
        self.adopt(leader);
        LeadStep::Forward
    }

    /// Take a leader learned outside the ring, ending any election in progress.
    ///
    /// Returns `true` if the leader changed.
    pub fn adopt(&mut self, leader: NodeAddress) -> bool {
        self.voting = false;
        self.candidate = None;
        let changed = self.leader.as_ref() != Some(&leader);
        self.leader = Some(leader);
        changed
    }

    pub fn become_leader(&mut self) {
        self.adopt(self.local.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Unwrap is ok in test code")]
mod tests {
    use super::*;
    use crate::directory::successor;
    use std::collections::{BTreeSet, VecDeque};

    fn address(n: u8) -> NodeAddress {
        NodeAddress::new(format!("10.0.0.{n}"), 10001)
    }

    enum Token {
        Vote(NodeAddress),
        Lead(NodeAddress),
    }

    /// Run elections on a ring until no tokens are in flight. Returns the nodes that declared
    /// themselves elected, in order.
    fn run_ring(ring: &[u8], rule: ElectionRule, starters: &[u8]) -> (Vec<Election>, Vec<NodeAddress>) {
        let servers: BTreeSet<_> = ring.iter().copied().map(address).collect();
        let mut nodes: Vec<Election> = servers
            .iter()
            .map(|address| Election::new(address.clone(), rule))
            .collect();
        let index = |a: &NodeAddress| servers.iter().position(|s| s == a).unwrap();

        let mut in_flight = VecDeque::new();
        let mut elected = Vec::new();
        for starter in starters {
            let at = address(*starter);
            if let Step::Forward(candidate) = nodes[index(&at)].start(true) {
                in_flight.push_back((successor(&servers, &at).unwrap(), Token::Vote(candidate)));
            }
        }

        while let Some((to, token)) = in_flight.pop_front() {
            let next = successor(&servers, &to).unwrap();
            let node = &mut nodes[index(&to)];
            match token {
                Token::Vote(candidate) => match node.on_vote(&candidate) {
                    Step::Forward(c) => in_flight.push_back((next, Token::Vote(c))),
                    Step::Elected => {
                        elected.push(to.clone());
                        in_flight.push_back((next, Token::Lead(to)));
                    }
                    Step::Ignore => {}
                },
                Token::Lead(leader) => {
                    if node.on_lead(leader.clone()) == LeadStep::Forward && next != leader {
                        in_flight.push_back((next, Token::Lead(leader)));
                    }
                }
            }
        }
        (nodes, elected)
    }

    #[test]
    fn single_starter_elects_greatest_address() {
        let (nodes, elected) = run_ring(&[3, 1, 4, 2], ElectionRule::Max, &[1]);
        assert_eq!(elected, vec![address(4)]);
        for node in &nodes {
            assert_eq!(node.leader(), Some(&address(4)));
            assert!(!node.is_voting());
        }
    }

    #[test]
    fn concurrent_starters_elect_exactly_one() {
        let (nodes, elected) = run_ring(&[5, 2, 8, 1, 7], ElectionRule::Max, &[1, 2, 5, 7, 8]);
        assert_eq!(elected, vec![address(8)]);
        assert!(nodes.iter().all(|node| node.leader() == Some(&address(8))));
        assert_eq!(nodes.iter().filter(|node| node.is_leader()).count(), 1);
    }

    #[test]
    fn min_rule_elects_smallest_address() {
        let (nodes, elected) = run_ring(&[5, 2, 8], ElectionRule::Min, &[8, 5]);
        assert_eq!(elected, vec![address(2)]);
        assert!(nodes.iter().all(|node| node.role() != Role::Voting));
        assert_eq!(nodes[0].role(), Role::Leader);
        assert_eq!(nodes[1].role(), Role::Follower);
    }

    #[test]
    fn two_remaining_servers_after_failure() {
        // Leader 2 of ring 1, 2, 3 failed, 1 notices and starts an election among 1 and 3
        let (nodes, elected) = run_ring(&[1, 3], ElectionRule::Max, &[1]);
        assert_eq!(elected, vec![address(3)]);
        assert!(nodes.iter().all(|node| node.leader() == Some(&address(3))));
    }

    #[test]
    fn lone_server_is_elected_immediately() {
        let mut election = Election::new(address(1), ElectionRule::Max);
        assert_eq!(election.role(), Role::Leaderless);
        assert_eq!(election.start(false), Step::Elected);
        assert!(election.is_leader());
        assert!(!election.is_voting());
    }

    #[test]
    fn weaker_vote_is_replaced_and_equal_vote_swallowed() {
        let mut election = Election::new(address(5), ElectionRule::Max);
        assert_eq!(election.on_vote(&address(2)), Step::Forward(address(5)));
        assert!(election.is_voting());
        // Our own candidacy is already out, another weaker token adds nothing
        assert_eq!(election.on_vote(&address(3)), Step::Ignore);
        assert_eq!(election.on_vote(&address(9)), Step::Forward(address(9)));
        assert_eq!(election.on_vote(&address(9)), Step::Ignore);
    }

    #[test]
    fn lead_token_settles_at_the_leader() {
        let mut election = Election::new(address(1), ElectionRule::Max);
        assert_eq!(election.on_lead(address(3)), LeadStep::Forward);
        assert_eq!(election.on_lead(address(3)), LeadStep::Forward);
        assert_eq!(election.on_lead(address(1)), LeadStep::Settled);
        assert!(election.is_leader());
        assert!(!election.adopt(address(1)));
        assert!(election.adopt(address(4)));
    }

    #[test]
    fn second_election_reaches_voting_servers() {
        // The first election settles on 5. A later election started by 2 passes servers that
        // still agree on 5 and ones that are voting, all of them have to end up agreeing.
        let servers: BTreeSet<_> = [1, 2, 3, 4, 5].into_iter().map(address).collect();
        let (mut nodes, _) = run_ring(&[1, 2, 3, 4, 5], ElectionRule::Max, &[1]);
        let mut token = Some((address(3), Token::Vote(address(2))));
        assert_eq!(nodes[1].start(true), Step::Forward(address(2)));
        while let Some((to, t)) = token.take() {
            let i = servers.iter().position(|s| *s == to).unwrap();
            let next = successor(&servers, &to).unwrap();
            token = match t {
                Token::Vote(c) => match nodes[i].on_vote(&c) {
                    Step::Forward(c) => Some((next, Token::Vote(c))),
                    Step::Elected => Some((next, Token::Lead(to))),
                    Step::Ignore => None,
                },
                Token::Lead(l) => (nodes[i].on_lead(l.clone()) == LeadStep::Forward && next != l)
                    .then(|| (next, Token::Lead(l))),
            };
        }
        for node in &nodes {
            assert_eq!(node.leader(), Some(&address(5)));
            assert_ne!(node.role(), Role::Voting);
        }
    }
}
