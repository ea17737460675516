//! Runtime configuration for the relay.
//!
//! The binary builds a [`RelayConfig`] from its command-line flags; tests
//! usually start from [`RelayConfig::default`] and tweak single fields with
//! the `with_*` helpers.

/// Size of the buffer used for one socket read in [`Framing::Chunk`] mode.
pub const DEFAULT_READ_BUFFER: usize = 4096;

/// Longest message accepted in [`Framing::Lines`] mode, terminator
/// included. Longer input is cut into pieces of this size.
pub const DEFAULT_MAX_LINE: usize = 16 * DEFAULT_READ_BUFFER;

/// Default depth of each session's delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default depth of the broadcaster's publish intake.
pub const DEFAULT_PUBLISH_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub queue: QueueConfig,
    pub publish_capacity: usize,
    pub framing: Framing,
    pub read_buffer: usize,
    pub max_line: usize,
    /// Enables the in-band `rename|<name>` and `who` commands.
    pub commands: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            publish_capacity: DEFAULT_PUBLISH_CAPACITY,
            framing: Framing::Lines,
            read_buffer: DEFAULT_READ_BUFFER,
            max_line: DEFAULT_MAX_LINE,
            commands: false,
        }
    }
}

impl RelayConfig {
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_commands(mut self, enabled: bool) -> Self {
        self.commands = enabled;
        self
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    pub fn with_publish_capacity(mut self, capacity: usize) -> Self {
        self.publish_capacity = capacity.max(1);
        self
    }
}

/// Shape of every session's delivery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// `None` means unbounded: pushes never fail and memory grows with the
    /// slowest reader.
    pub capacity: Option<usize>,
    /// What the dispatcher does when a bounded queue is full.
    pub overflow: OverflowPolicy,
}

impl QueueConfig {
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::Disconnect,
        }
    }

    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            overflow,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::bounded(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::Disconnect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OverflowPolicy {
    /// Skip the message for the slow session only.
    Drop,
    /// Evict the slow session and close its connection.
    Disconnect,
}

/// How inbound bytes are cut into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Framing {
    /// Every socket read is one message, minus one trailing line terminator.
    Chunk,
    /// Bytes are buffered and split on `\n`.
    Lines,
}
