//! # Chat Fabric - Server Implementation
//!
//! This crate contains the chat server. Servers discover each other by UDP broadcast, form a
//! logical ring ordered by address, and elect a leader on that ring. Every server pings its
//! ring neighbor to detect failures.
//!
//! For the protocol definition, look into the [`protocol`] crate.
//!
//! The server architecture comprises of threads, which use blocking operations with timeouts.
//! There is one listener thread per socket: unicast TCP, discovery broadcast and the two
//! multicast groups. Accepted unicast connections are served on a [`thread_pool::ThreadPool`].
//! A separate thread runs the heartbeat. All threads share one [`Server`] behind an
//! [`std::sync::Arc`], which keeps each piece of state behind its own lock.
//!
//! The server logic lives in the [`server`] module, outbound network traffic goes through
//! [`transport::Transport`].

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![deny(clippy::unwrap_used, clippy::allow_attributes_without_reason)]
#![warn(clippy::perf, clippy::complexity, clippy::pedantic, clippy::suspicious)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    reason = "We're not going to write comprehensive docs"
)]

use std::{
    any::Any,
    sync::{Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

pub mod config;
pub mod console;
pub mod directory;
pub mod election;
pub mod heartbeat;
pub mod server;
pub mod transport;


pub use server::{Route, Server, Sockets, StartError};

/// Lock a mutex, carrying on with the data of a thread that panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Text of a panic payload, for the two payload types `panic!` produces.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

pub trait ThreadJoin: Sized {
    fn join(self) -> thread::Result<()>;

    fn thread(&self) -> &thread::Thread;

    fn join_and_format_error(self) -> Result<(), String> {
        let name = self.thread().name().unwrap_or("").to_string();
        self.join()
            .map_err(|e| format!("Thread {name} panicked: {}", panic_message(&*e)))
    }
}

impl ThreadJoin for JoinHandle<()> {
    fn join(self) -> thread::Result<()> {
        self.join()
    }

    fn thread(&self) -> &thread::Thread {
        self.thread()
    }
}
