//! Turns a finished text into client-sized chunks for providers that only
//! answer in one piece.

use futures_util::Stream;
use std::time::Duration;

pub const DEFAULT_CHUNK_CHARS: usize = 20;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

const SENTENCE_ENDS: &[char] = &['。', '！', '？', '\n'];

/// Split `text` into pieces of about `target` characters. A piece is cut
/// once it reaches `target` chars or ends with sentence punctuation; the
/// trailing fragment is always kept, so the pieces concatenate to `text`.
pub fn rechunk(text: &str, target: usize) -> Vec<String> {
    let target = target.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count >= target || SENTENCE_ENDS.contains(&ch) {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// `rechunk` with a fixed delay before every chunk after the first.
pub fn pseudo_stream(text: String, target: usize, delay: Duration) -> impl Stream<Item = String> + Send {
    async_stream::stream! {
        for (idx, chunk) in rechunk(&text, target).into_iter().enumerate() {
            if idx > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            yield chunk;
        }
    }
}
