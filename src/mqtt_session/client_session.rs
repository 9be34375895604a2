// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_client::error::MqttClientError;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv3::{MqttPubRel, MqttPublish};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::OwnedSemaphorePermit;

/// Where an outbound QoS 1/2 exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStage {
    /// PUBLISH written (or queued), waiting for PUBACK / PUBREC.
    Published,
    /// PUBREL written (or queued), waiting for PUBCOMP.
    Released,
}

#[derive(Debug)]
pub struct OutboundEntry {
    pub seq: u64,
    pub publish: MqttPublish,
    pub stage: OutboundStage,
    /// In-flight window slot, returned when the entry is dropped.
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Receiver side progress of an inbound QoS 2 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStage {
    /// PUBREC sent, waiting for PUBREL
    Received,
    /// PUBREL arrived and the message is with the application callback
    Delivering,
    /// The callback returned; PUBCOMP may be sent
    Delivered,
}

#[derive(Debug, Clone)]
pub struct InboundEntry {
    pub seq: u64,
    pub publish: MqttPublish,
    pub stage: InboundStage,
}

#[derive(Debug, PartialEq)]
pub enum PubRecOutcome {
    /// First PUBREC: the exchange moves to the PUBREL stage.
    Release(MqttPubRel),
    /// Already in the PUBREL stage; resend PUBREL only.
    Duplicate(MqttPubRel),
    Unknown,
}

#[derive(Debug, PartialEq)]
pub enum IncomingQos2 {
    New,
    /// Same id is still waiting for PUBREL: answer PUBREC, do not deliver.
    Duplicate,
}

#[derive(Debug, PartialEq)]
pub enum PubRelOutcome {
    Deliver(MqttPublish),
    /// The first PUBREL's delivery has not finished; send nothing yet.
    InProgress,
    AlreadyDelivered,
    Unknown,
}

/// Client side session state for one client id.
///
/// Tracks unfinished QoS 1/2 exchanges in both directions and owns packet
/// identifier allocation. The engine mirrors every change into persistence.
#[derive(Debug)]
pub struct ClientSession {
    outbound: BTreeMap<u16, OutboundEntry>,
    inbound: HashMap<u16, InboundEntry>,
    // ids held by SUBSCRIBE / UNSUBSCRIBE awaiting their ack
    reserved: HashSet<u16>,
    // ids of QoS 1/2 publishes being persisted, not yet outbound
    staged: HashSet<u16>,
    next_id: u16,
    next_seq: u64,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    pub fn new() -> Self {
        ClientSession {
            outbound: BTreeMap::new(),
            inbound: HashMap::new(),
            reserved: HashSet::new(),
            staged: HashSet::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    fn id_in_use(&self, id: u16) -> bool {
        self.outbound.contains_key(&id) || self.reserved.contains(&id) || self.staged.contains(&id)
    }

    /// Allocates a packet identifier not used by any unacknowledged operation.
    pub fn next_packet_id(&mut self) -> Result<u16, MqttClientError> {
        let start = self.next_id;
        let mut candidate = start;
        loop {
            let following = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !self.id_in_use(candidate) {
                self.next_id = following;
                return Ok(candidate);
            }
            candidate = following;
            if candidate == start {
                return Err(MqttClientError::PacketIdExhausted);
            }
        }
    }

    /// Reserves an id for a SUBSCRIBE / UNSUBSCRIBE.
    pub fn reserve_packet_id(&mut self) -> Result<u16, MqttClientError> {
        let id = self.next_packet_id()?;
        self.reserved.insert(id);
        Ok(id)
    }

    /// Holds an id for a publish until [`ClientSession::handle_outgoing_publish`]
    /// takes it over or [`ClientSession::unstage_packet_id`] gives it back.
    /// Unlike reservations, staged ids survive a connection loss.
    pub fn stage_packet_id(&mut self) -> Result<u16, MqttClientError> {
        let id = self.next_packet_id()?;
        self.staged.insert(id);
        Ok(id)
    }

    /// Returns false when the id is no longer staged (the session was cleared).
    pub fn unstage_packet_id(&mut self, id: u16) -> bool {
        self.staged.remove(&id)
    }

    pub fn release_packet_id(&mut self, id: u16) -> bool {
        self.reserved.remove(&id)
    }

    /// Frees the ids of SUBSCRIBE / UNSUBSCRIBE exchanges cut short by a
    /// connection loss.
    pub fn release_all_reserved(&mut self) {
        self.reserved.clear();
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn observe_seq(&mut self, seq: u64) {
        if seq >= self.next_seq {
            self.next_seq = seq + 1;
        }
    }

    pub fn handle_outgoing_publish(
        &mut self,
        seq: u64,
        publish: MqttPublish,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<u16, MqttClientError> {
        let id = publish.message_id.ok_or_else(|| MqttClientError::InternalError {
            message: "QoS > 0 publish without message id".to_string(),
        })?;
        self.staged.remove(&id);
        self.observe_seq(seq);
        self.outbound.insert(
            id,
            OutboundEntry {
                seq,
                publish,
                stage: OutboundStage::Published,
                permit,
            },
        );
        Ok(id)
    }

    /// Re-creates an outbound entry from a persisted record.
    pub fn restore_outbound(
        &mut self,
        seq: u64,
        publish: MqttPublish,
        stage: OutboundStage,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if let Some(id) = publish.message_id {
            self.observe_seq(seq);
            self.outbound.insert(
                id,
                OutboundEntry {
                    seq,
                    publish,
                    stage,
                    permit,
                },
            );
        }
    }

    pub fn restore_inbound(&mut self, seq: u64, publish: MqttPublish, delivered: bool) {
        if let Some(id) = publish.message_id {
            self.observe_seq(seq);
            self.inbound.insert(
                id,
                InboundEntry {
                    seq,
                    publish,
                    stage: if delivered {
                        InboundStage::Delivered
                    } else {
                        InboundStage::Received
                    },
                },
            );
        }
    }

    /// PUBACK finishes a QoS 1 send.
    pub fn handle_incoming_puback(&mut self, id: u16) -> Option<OutboundEntry> {
        match self.outbound.get(&id) {
            Some(entry) if entry.publish.qos == 1 => self.outbound.remove(&id),
            _ => None,
        }
    }

    pub fn handle_incoming_pubrec(&mut self, id: u16) -> PubRecOutcome {
        match self.outbound.get_mut(&id) {
            Some(entry) if entry.publish.qos == 2 => {
                let pubrel = MqttPubRel::new(id);
                if entry.stage == OutboundStage::Released {
                    PubRecOutcome::Duplicate(pubrel)
                } else {
                    entry.stage = OutboundStage::Released;
                    PubRecOutcome::Release(pubrel)
                }
            }
            _ => PubRecOutcome::Unknown,
        }
    }

    /// PUBCOMP finishes a QoS 2 send.
    pub fn handle_incoming_pubcomp(&mut self, id: u16) -> Option<OutboundEntry> {
        match self.outbound.get(&id) {
            Some(entry) if entry.stage == OutboundStage::Released => self.outbound.remove(&id),
            _ => None,
        }
    }

    /// Drops an outbound exchange in whatever stage it is.
    pub fn abandon_outbound(&mut self, id: u16) -> Option<OutboundEntry> {
        self.outbound.remove(&id)
    }

    pub fn handle_incoming_qos2_publish(&mut self, seq: u64, publish: MqttPublish) -> IncomingQos2 {
        let Some(id) = publish.message_id else {
            return IncomingQos2::New;
        };
        if self.inbound.contains_key(&id) {
            return IncomingQos2::Duplicate;
        }
        self.observe_seq(seq);
        self.inbound.insert(
            id,
            InboundEntry {
                seq,
                publish,
                stage: InboundStage::Received,
            },
        );
        IncomingQos2::New
    }

    /// The first PUBREL hands the message out for delivery; later ones wait
    /// for [`ClientSession::mark_delivered`].
    pub fn handle_incoming_pubrel(&mut self, id: u16) -> PubRelOutcome {
        let Some(entry) = self.inbound.get_mut(&id) else {
            return PubRelOutcome::Unknown;
        };
        match entry.stage {
            InboundStage::Received => {
                entry.stage = InboundStage::Delivering;
                PubRelOutcome::Deliver(entry.publish.clone())
            }
            InboundStage::Delivering => PubRelOutcome::InProgress,
            InboundStage::Delivered => PubRelOutcome::AlreadyDelivered,
        }
    }

    /// Called once the application callback returned.
    pub fn mark_delivered(&mut self, id: u16) -> Option<InboundEntry> {
        let entry = self.inbound.get_mut(&id)?;
        if entry.stage != InboundStage::Delivering {
            return None;
        }
        entry.stage = InboundStage::Delivered;
        Some(entry.clone())
    }

    pub fn inbound(&self, id: u16) -> Option<&InboundEntry> {
        self.inbound.get(&id)
    }

    /// Drops the inbound entry once PUBCOMP has been written.
    /// Drops the inbound entry unless its callback is still running.
    pub fn finish_inbound(&mut self, id: u16) -> Option<InboundEntry> {
        match self.inbound.get(&id) {
            Some(entry) if entry.stage == InboundStage::Delivering => None,
            _ => self.inbound.remove(&id),
        }
    }

    pub fn outbound(&self, id: u16) -> Option<&OutboundEntry> {
        self.outbound.get(&id)
    }

    pub fn outbound_ids(&self) -> Vec<u16> {
        self.outbound.keys().copied().collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Packets to write after a reconnect, in original enqueue order.
    pub fn resend_pending_messages(&self) -> Vec<MqttPacket> {
        let mut pending: Vec<&OutboundEntry> = self.outbound.values().collect();
        pending.sort_by_key(|entry| entry.seq);
        pending
            .into_iter()
            .filter_map(|entry| {
                let id = entry.publish.message_id?;
                Some(match entry.stage {
                    OutboundStage::Published => {
                        let mut publish = entry.publish.clone();
                        publish.dup = true;
                        MqttPacket::Publish(publish)
                    }
                    OutboundStage::Released => MqttPacket::PubRel(MqttPubRel::new(id)),
                })
            })
            .collect()
    }

    /// Forgets everything, returning the ids of discarded outbound publishes.
    pub fn clear(&mut self) -> Vec<u16> {
        let ids = self.outbound_ids();
        self.outbound.clear();
        self.inbound.clear();
        self.reserved.clear();
        self.staged.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(id: u16, qos: u8) -> MqttPublish {
        MqttPublish::new("t".to_string(), qos, b"hello".to_vec(), Some(id), false, false)
    }

    #[test]
    fn test_packet_ids_skip_in_use_and_zero() {
        let mut session = ClientSession::new();
        assert_eq!(session.next_packet_id().unwrap(), 1);
        let seq = session.next_seq();
        session.handle_outgoing_publish(seq, publish(2, 1), None).unwrap();
        assert_eq!(session.reserve_packet_id().unwrap(), 3);

        session.next_id = u16::MAX;
        assert_eq!(session.next_packet_id().unwrap(), u16::MAX);
        assert_eq!(session.next_packet_id().unwrap(), 1);
        assert_eq!(session.next_packet_id().unwrap(), 4);
    }

    #[test]
    fn test_packet_id_exhaustion() {
        let mut session = ClientSession::new();
        for _ in 1..=u16::MAX {
            session.reserve_packet_id().unwrap();
        }
        assert!(matches!(
            session.next_packet_id(),
            Err(MqttClientError::PacketIdExhausted)
        ));
        session.release_packet_id(77);
        assert_eq!(session.next_packet_id().unwrap(), 77);
    }

    #[test]
    fn test_qos2_outbound_flow() {
        let mut session = ClientSession::new();
        session.handle_outgoing_publish(0, publish(5, 2), None).unwrap();

        assert!(session.handle_incoming_puback(5).is_none());
        assert!(session.handle_incoming_pubcomp(5).is_none());
        assert_eq!(
            session.handle_incoming_pubrec(5),
            PubRecOutcome::Release(MqttPubRel::new(5))
        );
        assert_eq!(
            session.handle_incoming_pubrec(5),
            PubRecOutcome::Duplicate(MqttPubRel::new(5))
        );
        assert_eq!(session.handle_incoming_pubrec(6), PubRecOutcome::Unknown);
        assert!(session.handle_incoming_pubcomp(5).is_some());
        assert_eq!(session.outbound_len(), 0);
    }

    #[test]
    fn test_qos2_inbound_delivers_once() {
        let mut session = ClientSession::new();
        assert_eq!(
            session.handle_incoming_qos2_publish(0, publish(9, 2)),
            IncomingQos2::New
        );
        assert_eq!(
            session.handle_incoming_qos2_publish(1, publish(9, 2)),
            IncomingQos2::Duplicate
        );
        assert!(matches!(
            session.handle_incoming_pubrel(9),
            PubRelOutcome::Deliver(_)
        ));
        // callback still running
        assert_eq!(session.handle_incoming_pubrel(9), PubRelOutcome::InProgress);
        assert_eq!(session.inbound(9).unwrap().stage, InboundStage::Delivering);
        assert!(session.finish_inbound(9).is_none());

        assert!(session.mark_delivered(9).is_some());
        assert!(session.mark_delivered(9).is_none());
        assert_eq!(
            session.handle_incoming_pubrel(9),
            PubRelOutcome::AlreadyDelivered
        );
        assert!(session.finish_inbound(9).is_some());
        assert_eq!(session.handle_incoming_pubrel(9), PubRelOutcome::Unknown);
    }

    #[test]
    fn test_resend_in_enqueue_order_with_dup() {
        let mut session = ClientSession::new();
        session.handle_outgoing_publish(10, publish(1, 1), None).unwrap();
        session.handle_outgoing_publish(4, publish(30, 2), None).unwrap();
        session.handle_outgoing_publish(7, publish(2, 2), None).unwrap();
        session.handle_incoming_pubrec(2);

        let packets = session.resend_pending_messages();
        assert_eq!(packets.len(), 3);
        match &packets[0] {
            MqttPacket::Publish(p) => {
                assert_eq!(p.message_id, Some(30));
                assert!(p.dup);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(packets[1], MqttPacket::PubRel(MqttPubRel::new(2)));
        assert_eq!(packets[2].packet_id(), Some(1));
        assert_eq!(session.next_seq(), 11);
    }

    #[test]
    fn test_staged_id_survives_connection_loss() {
        let mut session = ClientSession::new();
        let staged = session.stage_packet_id().unwrap();
        let reserved = session.reserve_packet_id().unwrap();
        session.release_all_reserved();
        assert_ne!(session.next_packet_id().unwrap(), staged);

        session.handle_outgoing_publish(0, publish(staged, 1), None).unwrap();
        assert!(!session.unstage_packet_id(staged));
        assert!(session.outbound(staged).is_some());
        assert!(!session.release_packet_id(reserved));

        let again = session.stage_packet_id().unwrap();
        session.clear();
        assert!(!session.unstage_packet_id(again));
    }

    #[test]
    fn test_restored_inbound_stage() {
        let mut session = ClientSession::new();
        session.restore_inbound(3, publish(4, 2), false);
        session.restore_inbound(5, publish(6, 2), true);
        assert!(matches!(
            session.handle_incoming_pubrel(4),
            PubRelOutcome::Deliver(_)
        ));
        assert_eq!(session.handle_incoming_pubrel(6), PubRelOutcome::AlreadyDelivered);
        assert_eq!(session.next_seq(), 6);
    }

    #[test]
    fn test_clear_returns_discarded_ids() {
        let mut session = ClientSession::new();
        session.handle_outgoing_publish(0, publish(1, 1), None).unwrap();
        session.handle_incoming_qos2_publish(1, publish(2, 2));
        assert_eq!(session.clear(), vec![1]);
        assert!(session.inbound(2).is_none());
    }
}
