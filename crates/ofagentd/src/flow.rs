//! Typed OpenFlow 1.3 flow entries.
//!
//! A [`FlowMod`] can only be obtained through [`FlowModBuilder::build`],
//! which rejects entries the switch would refuse or that would silently do
//! the wrong thing (adds without a concrete table, backwards gotos, deletes
//! carrying instructions). `Display` renders the `ovs-ofctl -O OpenFlow13`
//! flow syntax.

use std::fmt;

use ofagent_common::AgentError;
use ofagent_types::{MacAddress, OfPort};
use thiserror::Error;

use crate::constants::PRIORITY_DEFAULT;

/// Largest value of the 12-bit VLAN id field.
pub const MAX_VID: u16 = 0x0fff;

/// Flow table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    Id(u8),
    /// Every table; only valid for deletes.
    All,
}

impl TableId {
    pub fn contains(&self, table: u8) -> bool {
        match self {
            TableId::Id(t) => *t == table,
            TableId::All => true,
        }
    }
}

/// Output destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortNo {
    Port(OfPort),
    /// The switch's L2 learning pipeline.
    Normal,
}

impl fmt::Display for PortNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortNo::Port(p) => write!(f, "output:{}", p),
            PortNo::Normal => f.write_str("NORMAL"),
        }
    }
}

/// 802.1Q match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VlanMatch {
    Tagged(u16),
    /// Frames without an 802.1Q header.
    Untagged,
}

/// Match fields. Unset fields are wildcarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub in_port: Option<OfPort>,
    pub vlan: Option<VlanMatch>,
    pub tunnel_id: Option<u64>,
    pub eth_dst: Option<(MacAddress, MacAddress)>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_in_port(mut self, port: OfPort) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn with_vlan(mut self, vid: u16) -> Self {
        self.vlan = Some(VlanMatch::Tagged(vid));
        self
    }

    pub fn with_untagged(mut self) -> Self {
        self.vlan = Some(VlanMatch::Untagged);
        self
    }

    pub fn with_tunnel_id(mut self, tunnel_id: u64) -> Self {
        self.tunnel_id = Some(tunnel_id);
        self
    }

    pub fn with_eth_dst(mut self, mac: MacAddress, mask: MacAddress) -> Self {
        self.eth_dst = Some((mac, mask));
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &FlowMatch::default()
    }

    /// Non-strict delete semantics: true when every field set here is set
    /// to the same value in `entry`.
    pub fn covers(&self, entry: &FlowMatch) -> bool {
        fn field<T: PartialEq>(want: &Option<T>, have: &Option<T>) -> bool {
            match want {
                None => true,
                Some(w) => have.as_ref() == Some(w),
            }
        }

        field(&self.in_port, &entry.in_port)
            && field(&self.vlan, &entry.vlan)
            && field(&self.tunnel_id, &entry.tunnel_id)
            && field(&self.eth_dst, &entry.eth_dst)
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(port) = self.in_port {
            parts.push(format!("in_port={}", port));
        }
        match self.vlan {
            Some(VlanMatch::Tagged(vid)) => parts.push(format!("dl_vlan={}", vid)),
            Some(VlanMatch::Untagged) => parts.push("dl_vlan=0xffff".to_string()),
            None => {}
        }
        if let Some(tunnel_id) = self.tunnel_id {
            parts.push(format!("tun_id={:#x}", tunnel_id));
        }
        if let Some((mac, mask)) = self.eth_dst {
            parts.push(format!("dl_dst={}/{}", mac, mask));
        }
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    PopVlan,
    SetVlanVid(u16),
    SetTunnelId(u64),
    Output(PortNo),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::PopVlan => f.write_str("strip_vlan"),
            Action::SetVlanVid(vid) => write!(f, "mod_vlan_vid:{}", vid),
            Action::SetTunnelId(id) => write!(f, "set_field:{:#x}->tun_id", id),
            Action::Output(port) => write!(f, "{}", port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    ApplyActions(Vec<Action>),
    GotoTable(u8),
}

impl Instruction {
    pub fn actions(&self) -> &[Action] {
        match self {
            Instruction::ApplyActions(actions) => actions,
            Instruction::GotoTable(_) => &[],
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::ApplyActions(actions) => {
                let rendered: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
                f.write_str(&rendered.join(","))
            }
            Instruction::GotoTable(table) => write!(f, "goto_table:{}", table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowCommand {
    Add,
    Delete,
}

/// Flow construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("flow add must target a single table")]
    AddToAllTables,

    #[error("goto from table {from} to table {to} does not move forward")]
    GotoNotForward { from: u8, to: u8 },

    #[error("no instruction may follow goto_table")]
    InstructionAfterGoto,

    #[error("flow delete cannot carry instructions")]
    DeleteWithInstructions,

    #[error("non-strict flow delete cannot carry a priority")]
    DeleteWithPriority,

    #[error("invalid output port {0}")]
    InvalidOutputPort(OfPort),

    #[error("invalid in_port {0}")]
    InvalidMatchPort(OfPort),

    #[error("VLAN id {0} does not fit in 12 bits")]
    InvalidVlanVid(u16),
}

impl From<FlowError> for AgentError {
    fn from(e: FlowError) -> Self {
        AgentError::invalid_flow(e.to_string())
    }
}

/// A validated flow-table modification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowMod {
    table: TableId,
    priority: Option<u16>,
    command: FlowCommand,
    flow_match: FlowMatch,
    instructions: Vec<Instruction>,
}

impl FlowMod {
    /// Starts an add into `table` at the default priority.
    pub fn add(table: u8) -> FlowModBuilder {
        FlowModBuilder {
            inner: FlowMod {
                table: TableId::Id(table),
                priority: Some(PRIORITY_DEFAULT),
                command: FlowCommand::Add,
                flow_match: FlowMatch::default(),
                instructions: Vec::new(),
            },
        }
    }

    /// Starts a non-strict delete (any out port, any out group).
    pub fn delete(table: TableId) -> FlowModBuilder {
        FlowModBuilder {
            inner: FlowMod {
                table,
                priority: None,
                command: FlowCommand::Delete,
                flow_match: FlowMatch::default(),
                instructions: Vec::new(),
            },
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn priority(&self) -> Option<u16> {
        self.priority
    }

    pub fn command(&self) -> FlowCommand {
        self.command
    }

    pub fn flow_match(&self) -> &FlowMatch {
        &self.flow_match
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Applied actions in order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.instructions.iter().flat_map(Instruction::actions)
    }

    /// Switch ports this entry outputs to, in action order.
    pub fn output_ports(&self) -> Vec<OfPort> {
        self.actions()
            .filter_map(|a| match a {
                Action::Output(PortNo::Port(p)) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn goto_table(&self) -> Option<u8> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::GotoTable(t) => Some(*t),
            Instruction::ApplyActions(_) => None,
        })
    }

    /// An add with no instructions drops matching packets.
    pub fn is_drop(&self) -> bool {
        self.command == FlowCommand::Add && self.instructions.is_empty()
    }

    /// Same table, priority and match: an add with this key replaces `other`.
    pub fn same_key(&self, other: &FlowMod) -> bool {
        self.table == other.table
            && self.priority == other.priority
            && self.flow_match == other.flow_match
    }

    /// True when this delete removes the `entry` add.
    pub fn deletes(&self, entry: &FlowMod) -> bool {
        if self.command != FlowCommand::Delete || entry.command != FlowCommand::Add {
            return false;
        }
        let table_hit = match entry.table {
            TableId::Id(t) => self.table.contains(t),
            TableId::All => false,
        };
        table_hit && self.flow_match.covers(&entry.flow_match)
    }
}

impl fmt::Display for FlowMod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let TableId::Id(t) = self.table {
            parts.push(format!("table={}", t));
        }
        if let Some(p) = self.priority {
            parts.push(format!("priority={}", p));
        }
        let m = self.flow_match.to_string();
        if !m.is_empty() {
            parts.push(m);
        }
        if self.command == FlowCommand::Add {
            if self.instructions.is_empty() {
                parts.push("actions=drop".to_string());
            } else {
                let rendered: Vec<String> =
                    self.instructions.iter().map(|i| i.to_string()).collect();
                parts.push(format!("actions={}", rendered.join(",")));
            }
        }
        f.write_str(&parts.join(","))
    }
}

/// Builder for [`FlowMod`].
#[derive(Debug, Clone)]
#[must_use]
pub struct FlowModBuilder {
    inner: FlowMod,
}

impl FlowModBuilder {
    pub fn priority(mut self, priority: u16) -> Self {
        self.inner.priority = Some(priority);
        self
    }

    pub fn matching(mut self, flow_match: FlowMatch) -> Self {
        self.inner.flow_match = flow_match;
        self
    }

    pub fn apply(mut self, actions: Vec<Action>) -> Self {
        self.inner.instructions.push(Instruction::ApplyActions(actions));
        self
    }

    pub fn goto(mut self, table: u8) -> Self {
        self.inner.instructions.push(Instruction::GotoTable(table));
        self
    }

    pub fn build(self) -> Result<FlowMod, FlowError> {
        let flow = self.inner;

        if let Some(port) = flow.flow_match.in_port {
            if !port.is_valid() {
                return Err(FlowError::InvalidMatchPort(port));
            }
        }
        if let Some(VlanMatch::Tagged(vid)) = flow.flow_match.vlan {
            if vid > MAX_VID {
                return Err(FlowError::InvalidVlanVid(vid));
            }
        }

        match flow.command {
            FlowCommand::Add => {
                let table = match flow.table {
                    TableId::Id(t) => t,
                    TableId::All => return Err(FlowError::AddToAllTables),
                };
                let mut goto_seen = false;
                for instruction in &flow.instructions {
                    if goto_seen {
                        return Err(FlowError::InstructionAfterGoto);
                    }
                    match instruction {
                        Instruction::GotoTable(to) => {
                            if *to <= table {
                                return Err(FlowError::GotoNotForward { from: table, to: *to });
                            }
                            goto_seen = true;
                        }
                        Instruction::ApplyActions(actions) => {
                            for action in actions {
                                match action {
                                    Action::Output(PortNo::Port(p)) if !p.is_valid() => {
                                        return Err(FlowError::InvalidOutputPort(*p));
                                    }
                                    Action::SetVlanVid(vid) if *vid > MAX_VID => {
                                        return Err(FlowError::InvalidVlanVid(*vid));
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }
            FlowCommand::Delete => {
                if flow.priority.is_some() {
                    return Err(FlowError::DeleteWithPriority);
                }
                if !flow.instructions.is_empty() {
                    return Err(FlowError::DeleteWithInstructions);
                }
            }
        }

        Ok(flow)
    }
}
