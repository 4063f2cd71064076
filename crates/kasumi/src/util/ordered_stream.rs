use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Turns `(index, item)` pairs arriving in any order back into index order.
///
/// Indices must be dense and start at zero. Items that arrive ahead of their turn are held in
/// a buffer; the producer side is responsible for bounding how far ahead it may run.
pub struct OrderedStream<T> {
    // index -> item
    buffer: BTreeMap<u64, T>,
    next_index: u64,
    rx: mpsc::UnboundedReceiver<(u64, T)>,
}

impl<T> OrderedStream<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<(u64, T)>) -> Self {
        Self {
            buffer: BTreeMap::new(),
            next_index: 0,
            rx,
        }
    }

    /// Returns the next item in index order, or `None` once the channel is closed and the
    /// next index can no longer arrive. Items stranded behind a missing index stay buffered.
    pub async fn next(&mut self) -> Option<(u64, T)> {
        loop {
            if let Some(item) = self.buffer.remove(&self.next_index) {
                let index = self.next_index;
                self.next_index += 1;
                return Some((index, item));
            }

            match self.rx.recv().await {
                Some((index, item)) => {
                    if index == self.next_index {
                        self.next_index += 1;
                        return Some((index, item));
                    } else if index > self.next_index {
                        self.buffer.insert(index, item);
                    } else {
                        tracing::warn!("Dropping duplicated item #{index}");
                    }
                }
                None => return None,
            }
        }
    }

    /// Number of out-of-order items currently held back.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
