//! OS clipboard bridge

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arboard::Clipboard as ArboardClipboard;
use tokio::sync::mpsc;

use crate::protocol::{ClipboardItem, ContentHash};
use crate::{Error, Result};

const TEXT_PLAIN: &str = "text/plain";

/// Read and write access to a clipboard
pub trait ClipboardAccess: Send + Sync {
    /// Current contents, `None` when empty or in a format we do not carry
    fn read(&self) -> Result<Option<Vec<ClipboardItem>>>;
    fn write(&self, items: &[ClipboardItem]) -> Result<()>;
}

/// The system clipboard through arboard; carries plain text
#[derive(Debug, Default)]
pub struct SystemClipboard;

impl ClipboardAccess for SystemClipboard {
    fn read(&self) -> Result<Option<Vec<ClipboardItem>>> {
        let mut clipboard = ArboardClipboard::new().map_err(|e| Error::Clipboard(e.to_string()))?;

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => Ok(Some(vec![ClipboardItem::text(text)])),
            Ok(_) => Ok(None),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(Error::Clipboard(e.to_string())),
        }
    }

    fn write(&self, items: &[ClipboardItem]) -> Result<()> {
        let Some(text) = items.iter().find_map(|item| {
            (item.mime_type == TEXT_PLAIN)
                .then(|| item.as_text())
                .flatten()
        }) else {
            return Err(Error::Clipboard("no plain text item to write".to_string()));
        };

        let mut clipboard = ArboardClipboard::new().map_err(|e| Error::Clipboard(e.to_string()))?;
        clipboard
            .set_text(text)
            .map_err(|e| Error::Clipboard(e.to_string()))
    }
}

/// A clipboard held in memory, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    items: Arc<Mutex<Option<Vec<ClipboardItem>>>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClipboardAccess for MemoryClipboard {
    fn read(&self) -> Result<Option<Vec<ClipboardItem>>> {
        self.items
            .lock()
            .map(|items| items.clone())
            .map_err(|_| Error::Clipboard("memory clipboard poisoned".to_string()))
    }

    fn write(&self, items: &[ClipboardItem]) -> Result<()> {
        let mut slot = self
            .items
            .lock()
            .map_err(|_| Error::Clipboard("memory clipboard poisoned".to_string()))?;
        *slot = Some(items.to_vec());
        Ok(())
    }
}

/// Clipboard change event
#[derive(Debug, Clone)]
pub struct ClipboardChange {
    pub items: Vec<ClipboardItem>,
    pub hash: ContentHash,
}

/// Detects local clipboard changes and applies remote ones without echoing
/// them back
#[derive(Clone)]
pub struct ClipboardMonitor {
    clipboard: Arc<dyn ClipboardAccess>,
    /// Last content hash seen or written by us
    last_hash: Arc<Mutex<Option<ContentHash>>>,
}

impl ClipboardMonitor {
    pub fn new(clipboard: Arc<dyn ClipboardAccess>) -> Self {
        Self {
            clipboard,
            last_hash: Arc::new(Mutex::new(None)),
        }
    }

    /// Check if clipboard content has changed since last check
    pub fn check_change(&self) -> Result<Option<ClipboardChange>> {
        let items = self.clipboard.read()?;
        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| Error::Clipboard("clipboard state poisoned".to_string()))?;

        match items {
            Some(items) => {
                let hash = ContentHash::of(&items);
                if last.as_ref() == Some(&hash) {
                    return Ok(None);
                }
                *last = Some(hash);
                Ok(Some(ClipboardChange { items, hash }))
            }
            None => {
                *last = None;
                Ok(None)
            }
        }
    }

    /// Write items received from a peer; the next poll will not report them
    pub fn apply(&self, items: &[ClipboardItem]) -> Result<()> {
        self.clipboard.write(items)?;
        if let Ok(mut last) = self.last_hash.lock() {
            *last = Some(ContentHash::of(items));
        }
        Ok(())
    }

    /// Start a monitoring task that sends changes to a channel
    pub fn start(
        &self,
        poll_interval: Duration,
    ) -> (mpsc::Receiver<ClipboardChange>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let monitor = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;

                match monitor.check_change() {
                    Ok(Some(change)) => {
                        if tx.send(change).await.is_err() {
                            // Receiver dropped, stop monitoring
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("clipboard read error: {}", e);
                    }
                }
            }
        });

        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clipboard_roundtrip() {
        let clipboard = SystemClipboard;
        let items = vec![ClipboardItem::text("clipbridge test")];

        // This test may fail if run in headless environment
        if clipboard.write(&items).is_ok() {
            if let Ok(Some(read)) = clipboard.read() {
                assert_eq!(read, items);
            }
        }
    }

    #[test]
    fn test_system_clipboard_needs_text() {
        let result = SystemClipboard.write(&[ClipboardItem::new("image/png", vec![1, 2])]);
        assert!(matches!(result, Err(Error::Clipboard(_))));
    }

    #[test]
    fn test_change_detection() {
        let clipboard = MemoryClipboard::new();
        let monitor = ClipboardMonitor::new(Arc::new(clipboard.clone()));
        assert!(monitor.check_change().unwrap().is_none());

        clipboard.write(&[ClipboardItem::text("one")]).unwrap();
        let change = monitor.check_change().unwrap().unwrap();
        assert_eq!(change.items, vec![ClipboardItem::text("one")]);

        // Same content should not trigger change
        assert!(monitor.check_change().unwrap().is_none());
    }

    #[test]
    fn test_applied_items_not_echoed() {
        let clipboard = MemoryClipboard::new();
        let monitor = ClipboardMonitor::new(Arc::new(clipboard.clone()));

        monitor.apply(&[ClipboardItem::text("remote")]).unwrap();
        assert_eq!(clipboard.read().unwrap(), Some(vec![ClipboardItem::text("remote")]));
        assert!(monitor.check_change().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_changes() {
        let clipboard = MemoryClipboard::new();
        let monitor = ClipboardMonitor::new(Arc::new(clipboard.clone()));
        let (mut rx, handle) = monitor.start(Duration::from_millis(100));

        clipboard.write(&[ClipboardItem::text("typed")]).unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.hash, ContentHash::of(&[ClipboardItem::text("typed")]));
        handle.abort();
    }
}
