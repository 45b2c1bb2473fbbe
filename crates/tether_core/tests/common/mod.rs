//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Once;
use std::thread::{self, JoinHandle};
use tether_core::{current_thread, Entity};

static TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber once per test binary
///
/// Set `RUST_LOG=tether_core=trace` to see core diagnostics.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Commands understood by a [`Remote`] thread
pub enum Command {
    /// Drain the remote thread's queue once, then acknowledge
    Drain,
    /// Run a closure on the remote thread, then acknowledge
    Run(Box<dyn FnOnce() + Send>),
    /// Drop the remote entity, then acknowledge
    DropEntity,
}

/// A thread that only drains when told to
///
/// Gives tests exact control over when queued callbacks run.
pub struct Remote {
    commands: mpsc::Sender<Command>,
    acks: mpsc::Receiver<usize>,
    join: Option<JoinHandle<()>>,
}

impl Remote {
    /// Start the thread; returns it with an entity bound to it
    pub fn spawn(name: &str) -> (Self, Entity) {
        let (entity_tx, entity_rx) = mpsc::channel();
        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let (ack_tx, ack_rx) = mpsc::channel();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut entity = Some(Entity::named("remote-receiver"));
                entity_tx
                    .send(entity.clone().expect("entity just created"))
                    .expect("test thread gone");

                for command in command_rx {
                    let executed = match command {
                        Command::Drain => current_thread().drain().executed,
                        Command::Run(f) => {
                            f();
                            0
                        }
                        Command::DropEntity => {
                            entity.take();
                            0
                        }
                    };
                    if ack_tx.send(executed).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn remote thread");

        let entity = entity_rx.recv().expect("remote thread failed to start");
        let remote = Self {
            commands: command_tx,
            acks: ack_rx,
            join: Some(join),
        };
        (remote, entity)
    }

    /// Drain the remote queue once; returns the number of tasks run
    pub fn drain(&self) -> usize {
        self.send(Command::Drain)
    }

    pub fn run(&self, f: impl FnOnce() + Send + 'static) {
        self.send(Command::Run(Box::new(f)));
    }

    /// Drop the remote thread's own reference to its entity
    pub fn drop_entity(&self) {
        self.send(Command::DropEntity);
    }

    fn send(&self, command: Command) -> usize {
        self.commands.send(command).expect("remote thread gone");
        self.acks.recv().expect("remote thread gone")
    }
}

impl Drop for Remote {
    fn drop(&mut self) {
        let (closed, _) = mpsc::channel();
        self.commands = closed;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
