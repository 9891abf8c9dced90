#![deny(clippy::unwrap_used, clippy::allow_attributes_without_reason)]
#![warn(clippy::perf, clippy::complexity, clippy::pedantic, clippy::suspicious)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    reason = "We're not going to write comprehensive docs"
)]

//! Fixed-size pool of named worker threads.
//!
//! Workers that die from a panicking job are joined, reported to the panic handler and
//! replaced the next time a job is submitted, so the pool never shrinks.

use std::{
    any::Any,
    error::Error,
    io,
    num::NonZero,
    sync::{
        mpsc::{self, Receiver, RecvError, Sender},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

type PanicHandler = Box<dyn Fn(&str, Box<dyn Any + Send>) + Send + Sync>;
type Job = Box<dyn FnOnce() + Send + 'static>;
type Rx = Arc<Mutex<Receiver<Job>>>;

pub struct ThreadPool {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    name: String,
    panic_handler: PanicHandler,
    workers: Vec<Worker>,
    size: usize,
    next_id: usize,
    rx: Option<Rx>,
    tx: Option<Sender<Job>>,
}

fn new_poison_err(_: impl Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "ThreadPool lock poisoned")
}

impl ThreadPool {
    /// Create a new `ThreadPool` of `size` threads.
    ///
    /// Worker threads are named `<name>(<n>)`. `panic_handler` receives the name of a worker
    /// whose job panicked, together with the panic payload.
    pub fn new<P>(name: &str, size: NonZero<usize>, panic_handler: P) -> io::Result<ThreadPool>
    where
        P: Fn(&str, Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let mut inner = Inner {
            name: name.to_owned(),
            panic_handler: Box::new(panic_handler),
            workers: Vec::with_capacity(size.into()),
            size: size.into(),
            next_id: 0,
            rx: Some(Arc::new(Mutex::new(rx))),
            tx: Some(tx),
        };
        inner.respawn()?;

        Ok(ThreadPool {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn execute<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().map_err(new_poison_err)?;
        inner.respawn()?;
        inner
            .tx
            .as_ref()
            .expect("Invariant violated: sender should exist before ThreadPool::drop")
            .send(Box::new(f))
            .expect("Invariant violated: channel should always function before ThreadPool::drop");
        Ok(())
    }

    pub fn size(&self) -> io::Result<usize> {
        Ok(self.inner.lock().map_err(new_poison_err)?.size)
    }
}

impl Clone for ThreadPool {
    fn clone(&self) -> Self {
        ThreadPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Inner {
    /// Join workers that have quit and spawn replacements up to the pool size.
    fn respawn(&mut self) -> io::Result<()> {
        let (quit, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(Worker::has_quit);
        self.workers = running;
        for mut worker in quit {
            worker.join(&self.panic_handler);
        }

        let need = self.size.saturating_sub(self.workers.len());
        for _ in 0..need {
            let rx = Arc::clone(
                self.rx
                    .as_ref()
                    .expect("Invariant violated: receiver should exist before ThreadPool::drop"),
            );
            self.workers
                .push(Worker::new(format!("{}({})", self.name, self.next_id), rx)?);
            self.next_id = self.next_id.wrapping_add(1);
        }

        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Closing the channel lets idle workers fall out of their loop
        drop(self.tx.take());
        drop(self.rx.take());

        for worker in &mut self.workers {
            worker.join(&self.panic_handler);
        }
    }
}

#[derive(Debug)]
struct Worker {
    name: String,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(name: String, rx: Rx) -> io::Result<Worker> {
        let thread = thread::Builder::new().name(name.clone()).spawn(move || loop {
            let job = rx
                .lock()
                // Receiver mutex poisoned by other thread panic should not affect us
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            match job {
                Ok(job) => job(),
                Err(RecvError) => break,
            }
        })?;

        Ok(Worker {
            name,
            thread: Some(thread),
        })
    }

    fn join(&mut self, panic_handler: &PanicHandler) {
        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                (panic_handler)(&self.name, payload);
            }
        }
    }

    fn has_quit(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Unwrap is ok in test code")]
mod tests {
    use super::*;
    use std::{sync::mpsc::channel, time::Duration};

    fn new(size: usize, panics: Sender<String>) -> ThreadPool {
        let panics = Mutex::new(panics);
        ThreadPool::new("test-worker", size.try_into().unwrap(), move |name, _| {
            panics.lock().unwrap().send(name.to_owned()).unwrap();
        })
        .unwrap()
    }

    fn worker_count(pool: &ThreadPool) -> usize {
        pool.inner.lock().unwrap().workers.len()
    }

    #[test]
    fn runs_jobs_on_named_workers() {
        let (panic_tx, _panic_rx) = channel();
        let pool = new(3, panic_tx);
        assert_eq!(pool.size().unwrap(), 3);
        assert_eq!(worker_count(&pool), 3);

        let (tx, rx) = channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(move || {
                let name = thread::current().name().unwrap().to_owned();
                tx.send((i, name)).unwrap();
            })
            .unwrap();
        }

        let mut results: Vec<(i32, String)> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        results.sort();
        assert_eq!(results.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert!(results.iter().all(|(_, name)| name.starts_with("test-worker(")));
    }

    #[test]
    fn panicked_worker_is_reported_and_replaced() {
        let (panic_tx, panic_rx) = channel();
        let pool = new(2, panic_tx);

        pool.execute(|| panic!("job failed")).unwrap();
        thread::sleep(Duration::from_millis(500));

        // Submitting the next job reaps the dead worker
        let (tx, rx) = channel();
        pool.execute(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let name = panic_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.starts_with("test-worker("));
        assert_eq!(worker_count(&pool), 2);
    }

    #[test]
    fn drop_waits_for_queued_jobs() {
        let (panic_tx, _panic_rx) = channel();
        let pool = new(1, panic_tx);
        let (tx, rx) = channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(20));
                tx.send(i).unwrap();
            })
            .unwrap();
        }
        drop(pool);
        drop(tx);
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }
}
