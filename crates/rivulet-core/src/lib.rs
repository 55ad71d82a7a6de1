//! Rivulet Core - real-time audio graph coordinator
//!
//! This crate owns a mutable graph of audio-processing nodes and mediates
//! between two kinds of threads: control threads that edit the graph, and a
//! single hard-real-time audio thread that renders it one quantum at a time.
//! The audio thread never blocks, never allocates on the steady-state path,
//! and never destroys a node.
//!
//! # Core Abstractions
//!
//! ## Coordination
//!
//! - [`GraphLock`] - Owner-tracking lock with a non-blocking mode for the audio thread
//! - [`Graph`] - Nodes, dirty sets, pull registry and deletion queues behind the lock
//! - [`NodeRegistry`] - Keep-alive references and staged, deferred node deletion
//!
//! ## Rendering
//!
//! - [`Graph::render_quantum`] - Pre-render maintenance, render, post-render maintenance
//! - [`ThreadedDriver`] - A named audio thread rendering on a fixed period
//! - [`NodeProcessor`] - The DSP side of a node
//!
//! ## Lifecycle
//!
//! - [`Session`] - Suspended / Running / Interrupted / Closed state machine
//! - [`AudioContext`] - Facade with node factories, teardown and diagnostics
//! - [`NodeHandle`] - Client reference to a node, released on drop
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rivulet_core::{AudioContext, ContextOptions};
//! use rivulet_core::processors::{ConstantSource, Gain};
//!
//! let context = AudioContext::threaded(ContextOptions::default(), Duration::from_millis(2))?;
//! let source = context.create_constant_source(ConstantSource::new(0.25).with_duration(48_000))?;
//! let gain = context.create_gain(Gain::new(0.5))?;
//! context.connect(&source, 0, &gain, 0)?;
//! context.connect(&gain, 0, &context.destination(), 0)?;
//!
//! // Deletion work the audio thread hands back runs here.
//! context.pump_control_tasks();
//! context.close().wait()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Logging
//!
//! Enable the `tracing` feature to emit `tracing` events from control-thread
//! paths and maintenance summaries. Nothing is logged per node or per sample.

pub mod context;
pub mod control;
pub mod driver;
pub mod error;
pub mod graph;
pub mod lock;
pub mod processors;
pub mod session;
pub mod stats;

pub use context::{
    AudioContext, AutoplayPolicy, ContextDiagnostics, ContextOptions, LiveSessions, NodeHandle, RenderedAudio,
};
pub use control::ControlTask;
pub use driver::{RenderTarget, ThreadedDriver};
pub use error::{ContextError, GraphError, SessionError};
pub use graph::{
    AudioBus, ChannelMode, Graph, GraphConfig, Node, NodeId, NodeProcessor, NodeRegistry, NodeSpec, PortKey,
    PortKind, ProcessIo, RefCounts, RefKind,
};
pub use lock::{GraphGuard, GraphLock, LockOutcome, ThreadToken};
pub use session::{
    AllowAll, Completion, DeviceSession, NullDevice, PermissionGate, Session, SessionKind, SessionState,
    StateCallback, StateChange, Transition,
};
pub use stats::EngineStats;
