use std::{
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use common::{
    node::{Node, NodeConfig},
    robot::{LineObservations, OdometryMessage},
    PerfStats,
};
use pubsub::{PubSub, Publisher, Subscription};
use serde::Deserialize;

use crate::coordinator::{SlamCoordinator, SnapshotMessage};
use crate::ekf::EkfSlamConfig;

/// One entry of the estimator inbox. Both input streams are funneled through
/// a single channel so that at most one update runs at a time and each runs
/// to completion before the next one starts.
enum SlamEvent {
    Odometry(Arc<OdometryMessage>),
    Landmarks(Arc<LineObservations>),
    Shutdown,
}

/// Bridges the pubsub topics and the estimator worker thread.
///
/// `update` forwards incoming messages into the inbox in arrival order; the
/// worker owns the [`SlamCoordinator`] and publishes a snapshot after every
/// prediction. Slow snapshot consumers should subscribe bounded so that
/// overflow is dropped instead of piling up.
pub struct SlamNode {
    sub_odometry: Subscription<OdometryMessage>,
    sub_landmarks: Subscription<LineObservations>,
    inbox: Sender<SlamEvent>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Clone, Deserialize)]
pub struct SlamNodeConfig {
    topic_odometry: String,
    topic_landmarks: String,
    topic_snapshot: String,

    #[serde(default)]
    config: EkfSlamConfig,
}

impl NodeConfig for SlamNodeConfig {
    fn instantiate(&self, pubsub: &mut PubSub) -> Box<dyn Node> {
        let (inbox, events) = channel();
        let publisher = pubsub.publish(&self.topic_snapshot);
        let coordinator = SlamCoordinator::new(self.config.clone());

        let worker = thread::spawn(move || estimator_thread(coordinator, events, publisher));

        Box::new(SlamNode {
            sub_odometry: pubsub.subscribe(&self.topic_odometry),
            sub_landmarks: pubsub.subscribe(&self.topic_landmarks),
            inbox,
            worker: Some(worker),
        })
    }
}

impl Node for SlamNode {
    fn update(&mut self) {
        // within each stream the order is preserved; across the two streams
        // the inbox order is whatever arrived first
        while let Some(msg) = self.sub_odometry.try_recv() {
            let _ = self.inbox.send(SlamEvent::Odometry(msg));
        }
        while let Some(batch) = self.sub_landmarks.try_recv() {
            let _ = self.inbox.send(SlamEvent::Landmarks(batch));
        }
    }

    fn terminate(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.inbox.send(SlamEvent::Shutdown);
            if worker.join().is_err() {
                log::error!("estimator worker panicked");
            }
        }
    }
}

impl Drop for SlamNode {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// The single consumer of the estimator inbox: every event is handled to
/// completion here, which is what serializes the two input streams.
fn estimator_thread(
    mut coordinator: SlamCoordinator,
    events: Receiver<SlamEvent>,
    mut publisher: Publisher<SnapshotMessage>,
) {
    let mut stats = PerfStats::new();

    while let Ok(event) = events.recv() {
        let started = Instant::now();

        match event {
            SlamEvent::Odometry(msg) => {
                if let Some(snapshot) = coordinator.handle_odometry(&msg) {
                    publisher.publish(Arc::new(snapshot));
                }
            }
            SlamEvent::Landmarks(batch) => coordinator.handle_landmarks(&batch),
            SlamEvent::Shutdown => break,
        }

        stats.update(started.elapsed());
        if stats.samples() % 512 == 0 {
            log::debug!("estimator step time: {stats}");
        }
    }
}
