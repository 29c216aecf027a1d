//! Outstanding requests waiting for a response.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::time::Instant;

use flume::Sender;

use super::Reply;
use crate::messages::{MessageId, OpCode};

#[derive(Debug)]
pub(crate) struct Receipt {
    pub to: SocketAddr,
    pub opcode: OpCode,
    pub sent_at: Instant,
    pub deadline: Instant,
    pub replies: Sender<Reply>,
}

impl Receipt {
    /// Returns `true` if a response from `from` may answer this request.
    fn does_match(&self, from: &SocketAddr) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug, Default)]
/// Receipts by message id, plus a min-heap of their deadlines.
///
/// Answered receipts leave a stale heap entry behind, skipped on expiry.
pub(crate) struct Receipts {
    pending: HashMap<MessageId, Receipt>,
    deadlines: BinaryHeap<Reverse<(Instant, MessageId)>>,
}

impl Receipts {
    pub fn insert(&mut self, id: MessageId, receipt: Receipt) {
        self.deadlines.push(Reverse((receipt.deadline, id)));
        self.pending.insert(id, receipt);
    }

    /// Removes the receipt if it exists and the response came from the right address.
    pub fn remove(&mut self, id: &MessageId, from: &SocketAddr) -> Option<Receipt> {
        if !self.pending.get(id)?.does_match(from) {
            return None;
        }

        self.pending.remove(id)
    }

    /// Removes a receipt regardless of the address, used when sending failed.
    pub fn cancel(&mut self, id: &MessageId) -> Option<Receipt> {
        self.pending.remove(id)
    }

    /// Removes and returns every receipt whose deadline is not after `now`,
    /// soonest first.
    pub fn expire(&mut self, now: Instant) -> Vec<(MessageId, Receipt)> {
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }

            self.deadlines.pop();

            if self
                .pending
                .get(&id)
                .is_some_and(|receipt| receipt.deadline == deadline)
            {
                if let Some(receipt) = self.pending.remove(&id) {
                    expired.push((id, receipt));
                }
            }
        }

        if self.pending.is_empty() {
            self.deadlines.clear();
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn receipt(to: SocketAddr, sent_at: Instant, timeout: Duration) -> Receipt {
        Receipt {
            to,
            opcode: OpCode::PingRequest,
            sent_at,
            deadline: sent_at + timeout,
            replies: flume::unbounded().0,
        }
    }

    #[test]
    fn expires_soonest_first_and_stops_at_first_pending() {
        let mut receipts = Receipts::default();
        let now = Instant::now();
        let to: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let ids: Vec<MessageId> = (0..3).map(|_| MessageId::random()).collect();

        receipts.insert(ids[0], receipt(to, now, Duration::from_millis(30)));
        receipts.insert(ids[1], receipt(to, now, Duration::from_millis(10)));
        receipts.insert(ids[2], receipt(to, now, Duration::from_millis(20)));

        let expired: Vec<MessageId> = receipts
            .expire(now + Duration::from_millis(25))
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        assert_eq!(expired, vec![ids[1], ids[2]]);
        assert_eq!(receipts.len(), 1);

        assert!(receipts.expire(now + Duration::from_millis(29)).is_empty());
        assert_eq!(receipts.expire(now + Duration::from_millis(30)).len(), 1);
        assert!(receipts.is_empty());
    }

    #[test]
    fn answered_receipts_never_expire() {
        let mut receipts = Receipts::default();
        let now = Instant::now();
        let to: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let id = MessageId::random();

        receipts.insert(id, receipt(to, now, Duration::from_millis(10)));
        assert!(receipts.remove(&id, &to).is_some());

        assert!(receipts.expire(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn response_from_wrong_address() {
        let mut receipts = Receipts::default();
        let now = Instant::now();
        let id = MessageId::random();

        receipts.insert(
            id,
            receipt("127.0.0.1:4000".parse().unwrap(), now, Duration::from_secs(1)),
        );

        assert!(receipts
            .remove(&id, &"127.0.0.2:4000".parse().unwrap())
            .is_none());
        assert!(receipts
            .remove(&id, &"127.0.0.1:4001".parse().unwrap())
            .is_none());
        assert!(receipts
            .remove(&id, &"127.0.0.1:4000".parse().unwrap())
            .is_some());
    }
}
