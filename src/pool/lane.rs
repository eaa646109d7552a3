//! One pool lane: T threads sharing a single engine instance.

use crate::cancel::CancelToken;
use crate::chunking::{ChunkDescriptor, ChunkResult};
use crate::engine::{EngineFactory, Transcriber};
use crossbeam_channel::{Sender, bounded};
use std::sync::Mutex;
use std::thread;

/// Transcribe `chunks` with `threads` threads on one engine loaded for `lane`.
///
/// Threads take the engine lock only around the transcribe call. Every
/// chunk taken from the queue produces exactly one result on `results`;
/// chunks still queued when `cancel` fires are abandoned. If the engine
/// cannot be loaded every chunk is reported failed.
///
/// Returns the number of results sent.
pub fn run_lane(
    lane: usize,
    chunks: Vec<ChunkDescriptor>,
    threads: usize,
    factory: &dyn EngineFactory,
    language: &str,
    cancel: &CancelToken,
    results: &Sender<ChunkResult>,
) -> usize {
    if chunks.is_empty() {
        return 0;
    }

    let engine = match factory.load(lane) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(lane, chunks = chunks.len(), error = %e, "engine failed to load, failing lane");
            let message = format!("engine failed to load on lane {lane}: {e}");
            return chunks
                .iter()
                .filter(|chunk| results.send(ChunkResult::failure(chunk, message.clone())).is_ok())
                .count();
        }
    };
    let engine: Mutex<Box<dyn Transcriber>> = Mutex::new(engine);

    let total = chunks.len();
    let (queue_tx, queue_rx) = bounded(total);
    for chunk in chunks {
        // Capacity equals the chunk count
        if queue_tx.send(chunk).is_err() {
            break;
        }
    }
    drop(queue_tx);

    let threads = threads.clamp(1, total);
    tracing::debug!(lane, threads, chunks = total, "lane started");

    let sent: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let queue_rx = queue_rx.clone();
                let engine = &engine;
                scope.spawn(move || {
                    let mut sent = 0;
                    while let Ok(chunk) = queue_rx.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let result = transcribe_chunk(lane, engine, &chunk, language);
                        if results.send(result).is_err() {
                            break;
                        }
                        sent += 1;
                    }
                    sent
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(sent) => sent,
                Err(_) => {
                    tracing::error!(lane, "lane thread panicked");
                    0
                }
            })
            .sum()
    });

    tracing::debug!(lane, sent, chunks = total, "lane finished");
    sent
}

fn transcribe_chunk(
    lane: usize,
    engine: &Mutex<Box<dyn Transcriber>>,
    chunk: &ChunkDescriptor,
    language: &str,
) -> ChunkResult {
    let outcome = {
        let engine = engine.lock().unwrap_or_else(|p| p.into_inner());
        engine.transcribe(&chunk.file, language)
    };
    match outcome {
        Ok(transcript) => {
            tracing::debug!(lane, chunk = chunk.index, chars = transcript.text.chars().count(), "chunk transcribed");
            ChunkResult::success(chunk, transcript.text, transcript.segments)
        }
        Err(e) => {
            tracing::warn!(lane, chunk = chunk.index, error = %e, "chunk transcription failed");
            ChunkResult::failure(chunk, e.to_string())
        }
    }
}
