// filewriter.rs — buffered, optionally asynchronous sequential disk writer
//
// Save files are written strictly append-only through fixed-size pooled
// pages. With concurrency > 0 a dedicated thread owns the file handle and
// drains a bounded channel, so producers feel back-pressure instead of
// growing an unbounded heap of dirty pages. Position advances on enqueue,
// not on completion: index records can point at final offsets before the
// bytes hit the disk, because pages are committed in enqueue order.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;

use ruo_common::bufpool::BufferPool;

/// Page size for disk staging.
pub const PAGE_SIZE: usize = 4096;

enum Job {
    Page(Box<[u8]>, usize),
    Flush(Sender<()>),
}

pub struct FileQueue {
    pool: Arc<BufferPool>,
    page_size: usize,
    current: Option<(Box<[u8]>, usize)>,
    position: u64,

    // Exactly one of these is live, depending on concurrency.
    sync_file: Option<File>,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,

    error: Arc<Mutex<Option<io::Error>>>,
}

impl FileQueue {
    /// `concurrency` is the number of pages allowed in flight; zero means
    /// every page is written synchronously on enqueue.
    pub fn new(path: &Path, pool: Arc<BufferPool>, concurrency: usize) -> io::Result<FileQueue> {
        let file = File::create(path)?;
        let page_size = pool.buffer_size();
        let error = Arc::new(Mutex::new(None));

        let (sync_file, tx, worker) = if concurrency == 0 {
            (Some(file), None, None)
        } else {
            let (tx, rx) = bounded::<Job>(concurrency);
            let pool = Arc::clone(&pool);
            let error = Arc::clone(&error);

            let worker = thread::Builder::new()
                .name("file-queue".into())
                .spawn(move || {
                    let mut file = file;

                    for job in rx {
                        match job {
                            Job::Page(buffer, length) => {
                                if error.lock().is_none() {
                                    if let Err(e) = file.write_all(&buffer[..length]) {
                                        *error.lock() = Some(e);
                                    }
                                }
                                pool.release(buffer);
                            }
                            Job::Flush(ack) => {
                                if error.lock().is_none() {
                                    if let Err(e) = file.flush() {
                                        *error.lock() = Some(e);
                                    }
                                }
                                let _ = ack.send(());
                            }
                        }
                    }
                })
                .expect("spawn file-queue thread");

            (None, Some(tx), Some(worker))
        };

        Ok(FileQueue {
            pool,
            page_size,
            current: None,
            position: 0,
            sync_file,
            tx,
            worker,
            error,
        })
    }

    /// Bytes accepted so far; this is the on-disk offset the *next* enqueue
    /// will land at once everything commits.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn take_error(&self) -> io::Result<()> {
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, buffer: Box<[u8]>, length: usize) -> io::Result<()> {
        if let Some(tx) = &self.tx {
            // A full channel blocks here: that is the back-pressure slot.
            tx.send(Job::Page(buffer, length))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "file-queue worker gone"))?;
            Ok(())
        } else {
            let file = self.sync_file.as_mut().expect("sync file");
            let result = file.write_all(&buffer[..length]);
            self.pool.release(buffer);
            result
        }
    }

    pub fn enqueue(&mut self, mut data: &[u8]) -> io::Result<()> {
        self.take_error()?;
        self.position += data.len() as u64;

        while !data.is_empty() {
            let (buffer, used) = match self.current.take() {
                Some(page) => page,
                None => (self.pool.acquire(), 0),
            };

            let mut page = (buffer, used);
            let room = self.page_size - page.1;
            let count = room.min(data.len());
            page.0[page.1..page.1 + count].copy_from_slice(&data[..count]);
            page.1 += count;
            data = &data[count..];

            if page.1 == self.page_size {
                self.dispatch(page.0, page.1)?;
            } else {
                self.current = Some(page);
            }
        }

        Ok(())
    }

    /// Push out the partial page and wait until nothing is in flight.
    pub fn flush(&mut self) -> io::Result<()> {
        if let Some((buffer, used)) = self.current.take() {
            if used > 0 {
                self.dispatch(buffer, used)?;
            } else {
                self.pool.release(buffer);
            }
        }

        if let Some(tx) = &self.tx {
            let (ack_tx, ack_rx) = bounded(1);
            tx.send(Job::Flush(ack_tx))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "file-queue worker gone"))?;
            ack_rx
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "file-queue worker gone"))?;
        } else if let Some(file) = self.sync_file.as_mut() {
            file.flush()?;
        }

        self.take_error()
    }

    /// Flush and tear down the worker.
    pub fn close(mut self) -> io::Result<()> {
        let result = self.flush();

        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        result.and(self.take_error())
    }
}

impl Drop for FileQueue {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Write-only append-only stream over a FileQueue, with the position
/// tracked in-app so index records never wait on the disk.
pub struct SequentialFileWriter {
    queue: FileQueue,
}

impl SequentialFileWriter {
    pub fn new(path: &Path, pool: Arc<BufferPool>, concurrency: usize) -> io::Result<SequentialFileWriter> {
        Ok(SequentialFileWriter {
            queue: FileQueue::new(path, pool, concurrency)?,
        })
    }

    pub fn position(&self) -> u64 {
        self.queue.position()
    }

    pub fn close(self) -> io::Result<()> {
        self.queue.close()
    }
}

impl Write for SequentialFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue.enqueue(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.queue.flush()
    }
}
