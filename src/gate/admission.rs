//! Admission Queue
//!
//! Tickets are handed out when a load registers. Loads then pass the gates
//! one at a time, in ticket order, however the runtime schedules their tasks.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// A load's place in the admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

// == Admission Queue ==
/// Serves tickets strictly in the order they were issued.
///
/// Every issued ticket must eventually take its [`Turn`], or later tickets
/// wait forever.
#[derive(Debug)]
pub struct AdmissionQueue {
    next_ticket: AtomicU64,
    serving: watch::Sender<u64>,
}

/// The right to pass the gates. The next ticket is served when it drops.
#[derive(Debug)]
pub struct Turn<'a> {
    queue: &'a AdmissionQueue,
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            next_ticket: AtomicU64::new(0),
            serving,
        }
    }
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next place in line.
    ///
    /// Call under the same lock that orders registrations, so ticket order
    /// matches registration order.
    pub fn ticket(&self) -> Ticket {
        Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed))
    }

    // == Turn ==
    /// Waits until every earlier ticket has finished its turn.
    pub async fn turn(&self, ticket: Ticket) -> Turn<'_> {
        let mut serving = self.serving.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = serving.wait_for(|now| *now >= ticket.0).await;
        Turn { queue: self }
    }

    /// Tickets issued but not yet through their turn.
    pub fn waiting(&self) -> u64 {
        let issued = self.next_ticket.load(Ordering::Relaxed);
        issued.saturating_sub(*self.serving.borrow())
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.queue.serving.send_modify(|now| *now += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_first_ticket_served_immediately() {
        let queue = AdmissionQueue::new();
        let ticket = queue.ticket();

        let turn = tokio::time::timeout(Duration::from_millis(100), queue.turn(ticket))
            .await
            .expect("first ticket should not wait");
        assert_eq!(queue.waiting(), 1);

        drop(turn);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_turns_follow_ticket_order_not_spawn_order() {
        let queue = Arc::new(AdmissionQueue::new());
        let tickets: Vec<Ticket> = (0..5).map(|_| queue.ticket()).collect();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Spawn in reverse so the runtime is likely to poll later tickets first
        let mut handles = Vec::new();
        for (position, ticket) in tickets.into_iter().enumerate().rev() {
            let queue = queue.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _turn = queue.turn(ticket).await;
                tx.send(position).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        drop(tx);

        for handle in handles {
            handle.await.unwrap();
        }
        let mut order = Vec::new();
        while let Some(position) = rx.recv().await {
            order.push(position);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_later_ticket_waits_for_earlier_turn() {
        let queue = AdmissionQueue::new();
        let first = queue.ticket();
        let second = queue.ticket();

        let turn = queue.turn(first).await;
        let blocked = tokio::time::timeout(Duration::from_millis(30), queue.turn(second)).await;
        assert!(blocked.is_err());

        drop(turn);
        let _second = queue.turn(second).await;
        assert_eq!(queue.waiting(), 1);
    }
}
