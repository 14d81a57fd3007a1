//! Tests for wait-list ordering and racing removals.

extern crate std;

use self::std::{thread, vec::Vec};
use super::*;

#[derive(Debug)]
struct Waiter {
    name: &'static str,
    link: QueueItem,
}

impl Waiter {
    fn new(name: &'static str) -> Arc<Waiter> {
        Arc::new(Waiter { name, link: QueueItem::new() })
    }
}

impl Queued for Waiter {
    fn queue_item(&self) -> &QueueItem {
        &self.link
    }
}

fn names(q: &Queue<Waiter>) -> Vec<&'static str> {
    q.q_lock().iter().map(|w| w.name).collect()
}

#[test]
fn fifo_enqueue_and_pop() {
    let q = Queue::new();
    let (a, b) = (Waiter::new("a"), Waiter::new("b"));
    {
        let mut g = q.q_lock();
        g.enqueue(a.clone());
        g.enqueue(b.clone());
    }
    assert!(a.link.is_queued());
    assert_eq!(a.link.queue_id(), Some(q.id()));
    assert_eq!(names(&q), ["a", "b"]);

    let head = q.q_lock().pop_front().unwrap();
    assert_eq!(head.name, "a");
    assert_eq!(a.link.status(), Some(QueueStatus::Ok));
    assert_eq!(q.len(), 1);
}

#[test]
#[should_panic]
fn double_enqueue_panics() {
    let q = Queue::new();
    let a = Waiter::new("a");
    let mut g = q.q_lock();
    g.enqueue(a.clone());
    g.enqueue(a);
}

#[test]
fn prio_order_is_fifo_within_a_level() {
    let q = Queue::new();
    let mut g = q.q_lock();
    g.enqueue_prio(Waiter::new("low"), 5);
    g.enqueue_prio(Waiter::new("high1"), 10);
    g.enqueue_prio(Waiter::new("mid"), 7);
    g.enqueue_prio(Waiter::new("high2"), 10);
    drop(g);
    assert_eq!(names(&q), ["high1", "high2", "mid", "low"]);
}

#[test]
fn dequeue_checks_owner() {
    let q1 = Queue::<Waiter>::new();
    let q2 = Queue::<Waiter>::new();
    assert_ne!(q1.id(), q2.id());
    assert_eq!(q1.id() % 8, 0);

    let a = Waiter::new("a");
    q1.q_lock().enqueue(a.clone());
    assert!(!q2.dequeue(&a, QueueStatus::Invalid));
    assert!(!q2.q_lock().dequeue(&a, QueueStatus::Invalid));
    assert_eq!(q1.len(), 1);

    assert!(q1.dequeue(&a, QueueStatus::Invalid));
    assert_eq!(a.link.status(), Some(QueueStatus::Invalid));
    assert!(!q1.dequeue(&a, QueueStatus::Ok));
}

#[test]
fn racing_dequeue_has_one_winner() {
    for _ in 0..200 {
        let q = Arc::new(Queue::new());
        let target = Waiter::new("target");
        {
            let mut g = q.q_lock();
            g.enqueue(Waiter::new("x"));
            g.enqueue(target.clone());
            g.enqueue(Waiter::new("y"));
        }

        let handles: Vec<_> = [QueueStatus::Ok, QueueStatus::Invalid]
            .into_iter()
            .map(|status| {
                let q = q.clone();
                let target = target.clone();
                thread::spawn(move || q.dequeue(&target, status))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
        assert!(!target.link.is_queued());
        assert_eq!(names(&q), ["x", "y"]);
    }
}

#[test]
fn drain_marks_every_item() {
    let q = Queue::new();
    let (a, b) = (Waiter::new("a"), Waiter::new("b"));
    q.q_lock().enqueue(a.clone());
    q.q_lock().enqueue(b.clone());
    let drained = q.q_lock().drain(QueueStatus::Retry);
    assert_eq!(drained.len(), 2);
    assert!(q.is_empty());
    assert_eq!(b.link.status(), Some(QueueStatus::Retry));
}
