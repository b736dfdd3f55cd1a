//! A formatted mailbox region.
//!
//! Creating a mailbox is the orchestrator's job: it sizes the region, writes
//! the layout globals into slot 0, and stamps each mailslot with its peer id
//! before any endpoint attaches. Endpoints open an existing mailbox and only
//! read the globals.

use std::path::Path;

use tracing::debug;

use crate::config::MailboxConfig;
use crate::error::{MsgError, SetupError};
use crate::layout::{LayoutError, MailboxGlobals, RegionLayout};
use crate::region::{HeapRegion, MmapRegion, Region};
use crate::slot::Mailslot;

/// Mapped mailbox plus the layout read from it.
#[derive(Debug)]
pub struct Mailbox {
    region: Region,
    layout: RegionLayout,
}

impl Mailbox {
    /// Format a heap-backed mailbox.
    pub fn create(config: &MailboxConfig) -> Result<Self, SetupError> {
        Self::create_with_layout(config.layout())
    }

    /// Format a heap-backed mailbox with an explicit layout.
    pub fn create_with_layout(layout: RegionLayout) -> Result<Self, SetupError> {
        layout.validate()?;
        let region = HeapRegion::new_zeroed(layout.region_len()).map_err(SetupError::Io)?;
        Ok(Self::format(Region::Heap(region), layout))
    }

    /// Format a file-backed mailbox at `path`, truncating any existing file.
    pub fn create_file(path: impl AsRef<Path>, config: &MailboxConfig) -> Result<Self, SetupError> {
        let layout = config.layout();
        layout.validate()?;
        let region = MmapRegion::create(path, layout.region_len()).map_err(SetupError::Io)?;
        Ok(Self::format(Region::Mapped(region), layout))
    }

    /// Map a mailbox file formatted by someone else.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let region = Region::Mapped(MmapRegion::open(path).map_err(SetupError::Io)?);
        if region.len() < core::mem::size_of::<MailboxGlobals>() {
            return Err(SetupError::Layout(LayoutError::RegionTooSmall {
                required: core::mem::size_of::<MailboxGlobals>(),
                found: region.len(),
            }));
        }

        // SAFETY: the region holds at least one MailboxGlobals at offset 0.
        let globals = unsafe { region.base().cast::<MailboxGlobals>().read() };
        let layout = RegionLayout::from_globals(&globals);
        layout.validate()?;
        if region.len() < layout.region_len() {
            return Err(SetupError::Layout(LayoutError::RegionTooSmall {
                required: layout.region_len(),
                found: region.len(),
            }));
        }

        debug!(
            slot_size = layout.stride,
            buf_offset = layout.header_size,
            server_id = layout.coordinator_id,
            "opened mailbox"
        );
        Ok(Self { region, layout })
    }

    fn format(region: Region, layout: RegionLayout) -> Self {
        // SAFETY: the region was sized from this layout and is not shared yet.
        unsafe { region.base().cast::<MailboxGlobals>().write(layout.to_globals()) };

        let mailbox = Self { region, layout };
        for peer_id in layout.peer_ids() {
            if let Ok(slot) = mailbox.slot(u64::from(peer_id)) {
                slot.wipe(peer_id);
            }
        }

        debug!(
            slot_size = layout.stride,
            n_clients = layout.n_clients,
            server_id = layout.coordinator_id,
            len = mailbox.region.len(),
            "formatted mailbox"
        );
        mailbox
    }

    #[inline]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Resolve a peer's mailslot.
    pub fn slot(&self, peer_id: u64) -> Result<Mailslot<'_>, MsgError> {
        let header = self.layout.slot_address(self.region.base(), peer_id)?;
        // SAFETY: the resolver only yields slots inside the validated region.
        Ok(unsafe { Mailslot::from_raw(header, self.layout.max_payload()) })
    }

    /// Globals as currently stored in slot 0.
    pub fn globals(&self) -> MailboxGlobals {
        // SAFETY: slot 0 holds the globals for the life of the region.
        unsafe { self.region.base().cast::<MailboxGlobals>().read() }
    }

    pub fn path(&self) -> Option<&Path> {
        self.region.path()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::sync::Ordering;

    #[test]
    fn test_create_stamps_peer_ids() {
        let mailbox = Mailbox::create(&MailboxConfig {
            slot_size: 256,
            n_clients: 4,
        })
        .unwrap();

        let globals = mailbox.globals();
        assert_eq!(globals.slot_size, 256);
        assert_eq!(globals.buf_offset, 128);
        assert_eq!(globals.server_id, 5);
        assert_eq!(globals.n_events, 6);

        for id in 1..=5u64 {
            let slot = mailbox.slot(id).unwrap();
            assert_eq!(slot.peer_id(), id);
            assert!(slot.busy().is_idle());
            assert_eq!(slot.capacity(), 128);
        }
        assert!(mailbox.slot(0).is_err());
        assert!(mailbox.slot(6).is_err());
    }

    #[test]
    fn test_slots_do_not_overlap() {
        let mailbox = Mailbox::create(&MailboxConfig::default()).unwrap();
        let a = mailbox.slot(1).unwrap();
        let b = mailbox.slot(2).unwrap();

        a.stage(b"hello");
        a.busy().publish(5);
        assert!(b.busy().is_idle());
        assert_eq!(b.read_payload(5), vec![0u8; 5]);
        assert_eq!(a.read_payload(5), b"hello");
    }

    #[test]
    fn test_file_mailbox_round_trip() {
        let path = std::env::temp_dir().join(format!("ivshmsg_mailbox_{}.shm", std::process::id()));
        let config = MailboxConfig {
            slot_size: 256,
            n_clients: 2,
        };

        let created = Mailbox::create_file(&path, &config).unwrap();
        created
            .slot(2)
            .unwrap()
            .header()
            .last_responder
            .store(3, Ordering::Relaxed);

        let opened = Mailbox::open_file(&path).unwrap();
        assert_eq!(opened.layout(), created.layout());
        assert_eq!(
            opened
                .slot(2)
                .unwrap()
                .header()
                .last_responder
                .load(Ordering::Relaxed),
            3
        );
        assert_eq!(opened.path(), Some(path.as_path()));

        drop(created);
        drop(opened);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_open_rejects_garbage() {
        let path = std::env::temp_dir().join(format!("ivshmsg_garbage_{}.shm", std::process::id()));
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let err = Mailbox::open_file(&path).unwrap_err();
        assert!(matches!(err, SetupError::Layout(_)), "got {err}");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_open_rejects_overflowing_stride() {
        let path = std::env::temp_dir().join(format!("ivshmsg_stride_{}.shm", std::process::id()));
        let globals: [u64; 5] = [u64::MAX / 2, 128, 1, 3, 2];
        let mut bytes: Vec<u8> = globals.iter().flat_map(|v| v.to_ne_bytes()).collect();
        bytes.resize(4096, 0);
        std::fs::write(&path, bytes).unwrap();

        let err = Mailbox::open_file(&path).unwrap_err();
        assert!(
            matches!(
                err,
                SetupError::Layout(LayoutError::InvalidConfig("region size overflows"))
            ),
            "got {err}"
        );

        std::fs::remove_file(&path).ok();
    }
}
