//! Worker pool.
//!
//! Workers share one job receiver and hand their results back to the
//! dispatcher over a channel. Each job is one fat ray; the worker runs it
//! to completion through `process_ray` and ships the `WorkResults` back.
//! Admission control (at most `max_jobs` in flight) is the dispatcher's
//! job, not the pool's.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::engine::{process_ray, RenderContext};
use crate::ray::FatRay;
use crate::work::WorkResults;

pub(crate) enum Message {
    Job(FatRay),
    Terminate,
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(
        ctx: Arc<RenderContext>,
        receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
        results: mpsc::Sender<WorkResults>,
    ) -> Worker {
        let thread = thread::spawn(move || loop {
            let message = receiver.lock().unwrap().recv();

            match message {
                Ok(Message::Job(ray)) => {
                    // Everything from here down runs off the main thread
                    // and reads only the frozen context and this ray.
                    let mut out = WorkResults::new();
                    process_ray(&ctx, ray, &mut out);

                    if results.send(out).is_err() {
                        // Dispatcher is gone; nothing left to do.
                        break;
                    }
                }
                Ok(Message::Terminate) | Err(_) => break,
            }
        });

        Worker {
            thread: Some(thread),
        }
    }
}

pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    sender: mpsc::Sender<Message>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        ctx: Arc<RenderContext>,
        results: mpsc::Sender<WorkResults>,
    ) -> WorkerPool {
        assert!(size > 0);

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|_| Worker::new(ctx.clone(), receiver.clone(), results.clone()))
            .collect();

        WorkerPool { workers, sender }
    }

    /// Queue a ray for processing on some worker.
    pub fn submit(&self, ray: FatRay) {
        self.sender
            .send(Message::Job(ray))
            .expect("worker pool is gone");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Message::Terminate);
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::error!("render worker panicked");
                }
            }
        }
    }
}
