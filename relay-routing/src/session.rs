//! A routing session: the staged set of kernel rules that bridge one
//! downstream group interface to one upstream tunnel interface.

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, error, warn};

use crate::{command::Runner, sysctl};

#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error("sysctl: {0}")]
    Sysctl(#[from] std::io::Error),
    #[error("rule command: {0}")]
    Command(#[from] crate::command::Error),
}

/// One staged rule, able to apply itself and to revert what it applied.
#[derive(Debug)]
enum Rule {
    /// Enables `ip_forward`, remembering the previous value for revert.
    IpForward { previous: Option<String> },
    /// A shell rule with an explicit inverse.
    Cmd { apply: String, revert: String },
}

impl Rule {
    fn apply(&mut self) -> Result<(), ApplyError> {
        match self {
            Self::IpForward { previous } => {
                *previous = sysctl::read(sysctl::Ip::Forwarding).ok();
                sysctl::write(sysctl::Ip::Forwarding, "1")?;
            }
            Self::Cmd { apply, .. } => {
                Runner::by_str(apply)?;
            }
        }
        Ok(())
    }

    fn revert(&self) -> Result<(), ApplyError> {
        match self {
            Self::IpForward { previous } => {
                let value = previous.as_deref().unwrap_or("0");
                sysctl::write(sysctl::Ip::Forwarding, value)?;
            }
            Self::Cmd { revert, .. } => {
                Runner::by_str(revert)?;
            }
        }
        Ok(())
    }
}

/// The kernel-rule set for one (upstream, downstream, owner) triple.
///
/// Rules are staged by the builder methods and take effect only on
/// [`start`](RoutingSession::start). A session is built fresh for every start
/// attempt; reusing one across attempts risks reverting rules it never
/// applied.
#[derive(Debug)]
pub struct RoutingSession {
    upstream: String,
    downstream: String,
    owner: IpAddr,
    rules: Vec<Rule>,
    /// Number of leading rules currently applied.
    applied: usize,
    started: bool,
}

impl RoutingSession {
    pub fn new(
        upstream: impl Into<String>,
        downstream: impl Into<String>,
        owner: IpAddr,
    ) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            owner,
            rules: Vec::new(),
            applied: 0,
            started: false,
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn downstream(&self) -> &str {
        &self.downstream
    }

    pub fn owner(&self) -> IpAddr {
        self.owner
    }

    /// Stages enabling IPv4 forwarding. Wireless-direct groups don't enable
    /// `ip_forward` on their own.
    pub fn ip_forward(mut self) -> Self {
        self.rules.push(Rule::IpForward { previous: None });
        self
    }

    /// Stages the forwarding pair for this interface couple plus NAT on the
    /// upstream: downstream-to-upstream traffic is accepted, return traffic
    /// is accepted for established flows, and outbound packets are
    /// masqueraded behind the tunnel address.
    pub fn forward(mut self) -> Self {
        let (up, down) = (self.upstream.clone(), self.downstream.clone());
        self.stage(
            format!("iptables -w -I FORWARD -i {down} -o {up} -j ACCEPT"),
            format!("iptables -w -D FORWARD -i {down} -o {up} -j ACCEPT"),
        );
        self.stage(
            format!(
                "iptables -w -I FORWARD -i {up} -o {down} -m state --state ESTABLISHED,RELATED -j ACCEPT"
            ),
            format!(
                "iptables -w -D FORWARD -i {up} -o {down} -m state --state ESTABLISHED,RELATED -j ACCEPT"
            ),
        );
        self.stage(
            format!("iptables -w -t nat -I POSTROUTING -o {up} -j MASQUERADE"),
            format!("iptables -w -t nat -D POSTROUTING -o {up} -j MASQUERADE"),
        );
        self
    }

    /// Stages redirection of DNS queries addressed to the group owner onto
    /// the configured resolver. Clients are handed the owner address as
    /// their nameserver, but nothing answers port 53 there.
    pub fn dns_redirect(mut self, dns: SocketAddr) -> Self {
        let (down, owner) = (self.downstream.clone(), self.owner);
        for proto in ["udp", "tcp"] {
            self.stage(
                format!(
                    "iptables -w -t nat -I PREROUTING -i {down} -p {proto} -d {owner} --dport 53 -j DNAT --to-destination {dns}"
                ),
                format!(
                    "iptables -w -t nat -D PREROUTING -i {down} -p {proto} -d {owner} --dport 53 -j DNAT --to-destination {dns}"
                ),
            );
        }
        self
    }

    fn stage(&mut self, apply: String, revert: String) {
        self.rules.push(Rule::Cmd { apply, revert });
    }

    /// Applies all staged rules in order. Returns `false` on the first
    /// failing step; the caller must still call [`stop`](Self::stop) to
    /// revert whatever was applied before the failure.
    pub fn start(&mut self) -> bool {
        debug!(
            upstream = %self.upstream,
            downstream = %self.downstream,
            owner = %self.owner,
            rules = self.rules.len(),
            "applying routing rules"
        );

        for (i, rule) in self.rules.iter_mut().enumerate() {
            if let Err(e) = rule.apply() {
                error!(?rule, %e, "failed to apply routing rule");
                self.applied = i;
                return false;
            }
        }

        self.applied = self.rules.len();
        self.started = true;
        true
    }

    /// Reverts every applied rule in reverse order, best-effort. Returns
    /// `false` if any revert step failed; the kernel state may then be
    /// inconsistent and is left for diagnosis, not retried. Calling this
    /// with nothing applied is a no-op returning `true`.
    pub fn stop(&mut self) -> bool {
        self.started = false;
        if self.applied == 0 {
            return true;
        }

        let mut clean = true;
        for rule in self.rules[..self.applied].iter().rev() {
            if let Err(e) = rule.revert() {
                warn!(?rule, %e, "failed to revert routing rule");
                clean = false;
            }
        }
        self.applied = 0;
        clean
    }

    /// Whether [`start`](Self::start) has succeeded and no stop has run
    /// since.
    pub fn started(&self) -> bool {
        self.started
    }
}
