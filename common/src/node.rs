use pubsub::PubSub;

/// A Node is an entity that can publish and react to subscibed messages.
///
/// It can perform processing in the background (using `threads`) to do IO- or
/// compute-bound work while the host application drives `update` cooperatively.
pub trait Node {
    /// Allows the Node to update itself and perform logic. Note that this is
    /// called on the host thread and as such should be kept brief.
    fn update(&mut self) {}

    /// Called when the Node should terminate. Terminate background threads etc. here.
    fn terminate(&mut self) {}
}

pub trait NodeConfig {
    /// Constructs a new Node object. This should also subscribe or request permission to
    /// publish via the Publish/Subscribe mechanism.
    fn instantiate(&self, pubsub: &mut PubSub) -> Box<dyn Node>;
}
