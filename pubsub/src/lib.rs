use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, sync_channel, Receiver, RecvTimeoutError, Sender, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

type Message = Arc<dyn Any + Send + Sync + 'static>;

/// A simple publish/subscribe system that allows sending and subscribing to values on different
/// topics. Each topic name is allocated to a single type, attempts to subscribe and publish to
/// the same topic with different types will panic!
///
/// Delivery happens in `tick()`: all values published since the last call are fanned out to the
/// subscriber channels in publish order. Bounded subscribers that cannot keep up have the
/// overflowing values dropped rather than blocking the publisher.
pub struct PubSub {
    topics: HashMap<String, Topic>,
    signal: Receiver<Signal>,
    signal_source: Sender<Signal>,
}

struct Signal;

struct Topic {
    value_type: TypeId,
    value_name: &'static str,
    incoming_send: Sender<Message>,
    incoming_recv: Receiver<Message>,
    outgoing: Vec<Outgoing>,
}

enum Outgoing {
    /// Regular subscription, the channel grows as needed and delivery never fails.
    Unbounded(Sender<Message>),

    /// Capacity-limited subscription, delivery to a full channel drops the value.
    Bounded(std::sync::mpsc::SyncSender<Message>),
}

impl Outgoing {
    /// Delivers one value, returns `false` once the receiving side is gone.
    fn deliver(&self, topic: &str, value: Message) -> bool {
        match self {
            Outgoing::Unbounded(send) => send.send(value).is_ok(),
            Outgoing::Bounded(send) => match send.try_send(value) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::debug!("subscriber on topic '{topic}' is full, dropping value");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }
}

impl Topic {
    fn new<T: Any + Send + Sync + 'static>() -> Self {
        // create the channel where items will be sent to when published
        let (send, recv) = channel();

        Self {
            value_type: TypeId::of::<T>(),
            value_name: type_name::<T>(),
            incoming_send: send,
            incoming_recv: recv,
            outgoing: Vec::new(),
        }
    }
}

pub struct Subscription<T: Any + Send + Sync + 'static> {
    topic: String,
    receiver: Receiver<Message>,
    _phantom: PhantomData<T>,
}

impl<T: Any + Send + Sync + 'static> Subscription<T> {
    /// Tries to receive a value from the subscribed topic, but will not block if no data is
    /// available.
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        self.receiver.try_recv().ok().map(downcast::<T>)
    }

    /// Receives a value from the subscribed topic, blocking until one is available. Returns
    /// `None` when the other end of the channel has been closed.
    pub fn recv(&mut self) -> Option<Arc<T>> {
        self.receiver.recv().ok().map(downcast::<T>)
    }

    /// Like [`Subscription::recv`] but gives up after the timeout has elapsed.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Arc<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Some(downcast::<T>(value)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn downcast<T: Any + Send + Sync + 'static>(value: Message) -> Arc<T> {
    value
        .downcast::<T>()
        .expect("Received value was not of the expected type")
}

#[derive(Clone)]
pub struct Publisher<T: Any + Send + Sync + 'static> {
    topic: String,
    send: Sender<Message>,
    signal: Sender<Signal>,
    _p: PhantomData<T>,
}

impl<T: Any + Send + Sync + 'static> Publisher<T> {
    /// Publishes a value wrapped in an `Arc` to the topic.
    pub fn publish(&mut self, value: Arc<T>) {
        if self.send.send(value).is_err() {
            log::warn!("publishing to topic '{}' after the bus was dropped", self.topic);
            return;
        }
        let _ = self.signal.send(Signal);
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        let (send, receive) = channel();
        Self {
            topics: HashMap::new(),
            signal: receive,
            signal_source: send,
        }
    }

    fn get_topic_by_name_or_insert<T: Any + Send + Sync + 'static>(
        &mut self,
        topic: &str,
    ) -> &mut Topic {
        let t = self
            .topics
            .entry(topic.into())
            .or_insert_with(Topic::new::<T>);

        // make sure this topic was not previously claimed with a different type.
        assert!(
            t.value_type == TypeId::of::<T>(),
            "Topic {topic} already claimed by type '{}', but current type is '{}'",
            t.value_name,
            type_name::<T>()
        );

        t
    }

    /// Register as a publisher of the specific type to the topic name. Panics if the topic has
    /// already been allocated to values of a different type.
    pub fn publish<T: Any + Send + Sync + 'static>(&mut self, topic: &str) -> Publisher<T> {
        let t = self.get_topic_by_name_or_insert::<T>(topic);

        Publisher {
            topic: topic.to_string(),
            send: t.incoming_send.clone(),
            signal: self.signal_source.clone(),
            _p: PhantomData,
        }
    }

    /// Subscribe to messages of the specific type on the topic name. Panics if the topic has
    /// already been allocated to values of a different type.
    pub fn subscribe<T: Any + Send + Sync + 'static>(&mut self, topic: &str) -> Subscription<T> {
        let t = self.get_topic_by_name_or_insert::<T>(topic);

        // create a channel for receiving the published messages
        let (send, recv) = channel();

        t.outgoing.push(Outgoing::Unbounded(send));

        Subscription {
            topic: topic.to_owned(),
            receiver: recv,
            _phantom: PhantomData,
        }
    }

    /// Subscribe with a fixed channel capacity. When the subscriber falls more than `capacity`
    /// values behind, the overflowing values are dropped at distribution time instead of
    /// stalling the publisher. Intended for consumers like visualization that only care about
    /// reasonably fresh data.
    pub fn subscribe_bounded<T: Any + Send + Sync + 'static>(
        &mut self,
        topic: &str,
        capacity: usize,
    ) -> Subscription<T> {
        let t = self.get_topic_by_name_or_insert::<T>(topic);

        let (send, recv) = sync_channel(capacity);

        t.outgoing.push(Outgoing::Bounded(send));

        Subscription {
            topic: topic.to_owned(),
            receiver: recv,
            _phantom: PhantomData,
        }
    }

    /// Proceses and distributes messages to all subscribers. Subscriptions that have been
    /// dropped are forgotten here.
    pub fn tick(&mut self) {
        for (topic, t) in self.topics.iter_mut() {
            // read all the incoming messages and distribute them by cloning the Arc's
            while let Ok(v) = t.incoming_recv.try_recv() {
                t.outgoing.retain(|out| out.deliver(topic, v.clone()));
            }
        }

        // empty all signals as well
        while self.signal.try_recv().is_ok() {}
    }

    /// Starts a separate thread continously calling tick() whenever something was published.
    pub fn start_background_thread(self) -> PubSubThreadHandle {
        PubSubThreadHandle::new(self)
    }
}

pub struct PubSubThreadHandle {
    handle: JoinHandle<anyhow::Result<()>>,
    running: Arc<AtomicBool>,
    wake: Sender<Signal>,
}

impl PubSubThreadHandle {
    fn new(pubsub: PubSub) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let wake = pubsub.signal_source.clone();

        let handle = thread::spawn({
            let running = running.clone();
            move || Self::tick_thread(pubsub, running)
        });

        Self {
            handle,
            running,
            wake,
        }
    }

    pub fn stop(self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::Relaxed);

        // the distribution thread blocks until the next publish, wake it up explicitly
        let _ = self.wake.send(Signal);

        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("pubsub distribution thread panicked")),
        }
    }

    fn tick_thread(mut pubsub: PubSub, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        while running.load(Ordering::Relaxed) {
            // block on the signal
            pubsub.signal.recv()?;

            // process messages
            pubsub.tick();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Data(u32);

    #[test]
    fn delivers_to_all_subscribers() {
        let mut ps = PubSub::new();
        let mut s1 = ps.subscribe::<Data>("test");
        let mut s2 = ps.subscribe::<Data>("test");
        let mut p = ps.publish::<Data>("test");

        p.publish(Arc::new(Data(42)));
        ps.tick();

        assert_eq!(*s1.try_recv().unwrap(), Data(42));
        assert_eq!(*s2.try_recv().unwrap(), Data(42));
        assert!(s1.try_recv().is_none());
    }

    #[test]
    fn preserves_publish_order() {
        let mut ps = PubSub::new();
        let mut s = ps.subscribe::<Data>("ordered");
        let mut p = ps.publish::<Data>("ordered");

        for i in 0..5 {
            p.publish(Arc::new(Data(i)));
        }
        ps.tick();

        for i in 0..5 {
            assert_eq!(*s.try_recv().unwrap(), Data(i));
        }
    }

    #[test]
    fn bounded_subscription_drops_overflow() {
        let mut ps = PubSub::new();
        let mut s = ps.subscribe_bounded::<Data>("bounded", 2);
        let mut p = ps.publish::<Data>("bounded");

        for i in 0..5 {
            p.publish(Arc::new(Data(i)));
        }
        ps.tick();

        // the first two fit, the rest was dropped
        assert_eq!(*s.try_recv().unwrap(), Data(0));
        assert_eq!(*s.try_recv().unwrap(), Data(1));
        assert!(s.try_recv().is_none());
    }

    #[test]
    #[should_panic]
    fn type_conflict_panics() {
        let mut ps = PubSub::new();
        let _s = ps.subscribe::<Data>("conflict");
        let _p = ps.publish::<String>("conflict");
    }

    #[test]
    fn background_thread_distributes() {
        let mut ps = PubSub::new();
        let mut s = ps.subscribe::<Data>("bg");
        let mut p = ps.publish::<Data>("bg");

        let handle = ps.start_background_thread();

        p.publish(Arc::new(Data(7)));
        let received = s.recv_timeout(Duration::from_secs(5));
        assert_eq!(*received.unwrap(), Data(7));

        handle.stop().unwrap();
    }
}
