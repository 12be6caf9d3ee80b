//! In-process transport: every rank is a thread sharing a set of mailboxes

use super::{mailbox::Mailbox, AbortHook, CommsErrorKind, Source, Tag, Transport};
use std::sync::Arc;
use tracing::error;

pub struct LocalTransport {
    rank: usize,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl LocalTransport {
    /// One transport per rank of a group of `size`
    #[must_use]
    pub fn group(size: usize) -> Vec<LocalTransport> {
        let mailboxes: Arc<Vec<_>> = Arc::new((0..size).map(|r| Mailbox::new(r, size)).collect());
        (0..size)
            .map(|rank| LocalTransport {
                rank,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send_frame(&self, dest: usize, tag: Tag, data: &[u8]) -> Result<(), CommsErrorKind> {
        let mailbox = self.mailboxes.get(dest).ok_or(CommsErrorKind::InvalidRank {
            rank: dest,
            size: self.mailboxes.len(),
        })?;
        mailbox.deliver(self.rank, tag, data.to_vec());
        Ok(())
    }

    fn recv_frame(&self, source: Source, tag: Tag) -> Result<(usize, Vec<u8>), CommsErrorKind> {
        self.mailboxes[self.rank].take(source, tag)
    }

    fn abort(&self, code: i32) {
        error!(rank = self.rank, code, "Aborting the group");
        self.mailboxes.iter().for_each(|m| m.abort(code));
    }

    fn on_abort(&self, hook: AbortHook) {
        self.mailboxes[self.rank].set_abort_hook(hook);
    }

    fn aborted(&self) -> Option<i32> {
        self.mailboxes[self.rank].aborted()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        for (r, mailbox) in self.mailboxes.iter().enumerate() {
            if r != self.rank {
                mailbox.disconnect(self.rank);
            }
        }
    }
}
