/// Simulated two-slot OTA flash with the same state transitions the ESP-IDF
/// bootloader applies to app images
use ota_core::{BootImageState, Partition, PartitionStore};

/// First byte of every ESP application image
pub const IMAGE_MAGIC: u8 = 0xe9;

const SLOT_SIZE: u32 = 0x1a_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    #[error("no free update partition")]
    NoUpdatePartition,
    #[error("invalid write handle {0}")]
    InvalidHandle(u32),
    #[error("image would overflow partition")]
    PartitionFull,
    #[error("flash write failed")]
    WriteFailed,
    #[error("image validation failed")]
    InvalidImage,
    #[error("unknown partition")]
    UnknownPartition,
    #[error("device rebooted into previous image")]
    SimulatedReboot,
}

#[derive(Debug, Clone)]
struct Slot {
    partition: Partition,
    image: Vec<u8>,
    state: BootImageState,
}

#[derive(Debug, Clone)]
pub struct SimFlash {
    slots: Vec<Slot>,
    running: usize,
    boot: usize,
    open: Option<(u32, usize)>,
    next_handle: u32,
    writes: usize,
    rolled_back: bool,
    fail_write_at: Option<usize>,
}

impl SimFlash {
    /// `ota_0` running and valid, `ota_1` empty
    pub fn dual_slot() -> Self {
        let slot = |label: &str, subtype: u8, address: u32, state| Slot {
            partition: Partition::new(label, subtype, SLOT_SIZE, address),
            image: Vec::new(),
            state,
        };
        Self {
            slots: vec![
                slot("ota_0", 0x10, 0x1_0000, BootImageState::Valid),
                slot("ota_1", 0x11, 0x1b_0000, BootImageState::Undefined),
            ],
            running: 0,
            boot: 0,
            open: None,
            next_handle: 0,
            writes: 0,
            rolled_back: false,
            fail_write_at: None,
        }
    }

    /// Make the `index`-th write call fail
    pub fn with_failing_write(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    pub fn image(&self, label: &str) -> Option<&[u8]> {
        self.slots
            .iter()
            .find(|s| s.partition.label.as_str() == label)
            .map(|s| s.image.as_slice())
    }

    pub fn boot_partition(&self) -> Partition {
        self.slots[self.boot].partition.clone()
    }

    pub fn rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Restart into the boot partition; a new image starts pending verification
    pub fn reboot(&mut self) {
        self.running = self.boot;
        self.open = None;
        let slot = &mut self.slots[self.running];
        if slot.state == BootImageState::New {
            slot.state = BootImageState::PendingVerify;
        }
    }

    fn slot_index(&self, partition: &Partition) -> Result<usize, SimError> {
        self.slots
            .iter()
            .position(|s| s.partition == *partition)
            .ok_or(SimError::UnknownPartition)
    }

    fn open_slot(&self, handle: u32) -> Result<usize, SimError> {
        match self.open {
            Some((open, index)) if open == handle => Ok(index),
            _ => Err(SimError::InvalidHandle(handle)),
        }
    }
}

impl PartitionStore for SimFlash {
    type Error = SimError;
    type Handle = u32;

    fn app_partitions(&self) -> Vec<Partition> {
        self.slots.iter().map(|s| s.partition.clone()).collect()
    }

    fn running_partition(&self) -> Result<Partition, SimError> {
        Ok(self.slots[self.running].partition.clone())
    }

    fn next_update_partition(&self) -> Result<Partition, SimError> {
        self.slots
            .iter()
            .enumerate()
            .find(|(i, _)| *i != self.running)
            .map(|(_, s)| s.partition.clone())
            .ok_or(SimError::NoUpdatePartition)
    }

    fn image_state(&self, partition: &Partition) -> Result<BootImageState, SimError> {
        Ok(self.slots[self.slot_index(partition)?].state)
    }

    fn begin(&mut self, partition: &Partition) -> Result<u32, SimError> {
        let index = self.slot_index(partition)?;
        if index == self.running {
            return Err(SimError::NoUpdatePartition);
        }
        let slot = &mut self.slots[index];
        slot.image.clear();
        slot.state = BootImageState::Undefined;
        self.next_handle += 1;
        self.open = Some((self.next_handle, index));
        Ok(self.next_handle)
    }

    fn write(&mut self, handle: u32, data: &[u8]) -> Result<(), SimError> {
        let index = self.open_slot(handle)?;
        let call = self.writes;
        self.writes += 1;
        if self.fail_write_at == Some(call) {
            return Err(SimError::WriteFailed);
        }
        let slot = &mut self.slots[index];
        if slot.image.len() + data.len() > slot.partition.size as usize {
            return Err(SimError::PartitionFull);
        }
        slot.image.extend_from_slice(data);
        Ok(())
    }

    fn end(&mut self, handle: u32) -> Result<(), SimError> {
        let index = self.open_slot(handle)?;
        self.open = None;
        let slot = &mut self.slots[index];
        if slot.image.first() != Some(&IMAGE_MAGIC) {
            return Err(SimError::InvalidImage);
        }
        slot.state = BootImageState::New;
        Ok(())
    }

    fn abort(&mut self, handle: u32) -> Result<(), SimError> {
        let index = self.open_slot(handle)?;
        self.open = None;
        self.slots[index].image.clear();
        Ok(())
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), SimError> {
        let index = self.slot_index(partition)?;
        if self.slots[index].state != BootImageState::New
            && self.slots[index].state != BootImageState::Valid
        {
            return Err(SimError::InvalidImage);
        }
        self.boot = index;
        Ok(())
    }

    fn mark_running_valid(&mut self) -> Result<(), SimError> {
        self.slots[self.running].state = BootImageState::Valid;
        Ok(())
    }

    fn mark_running_invalid_and_rollback(&mut self) -> SimError {
        let bad = self.running;
        self.slots[bad].state = BootImageState::Invalid;
        match self
            .slots
            .iter()
            .position(|s| s.state == BootImageState::Valid)
        {
            Some(previous) => {
                self.boot = previous;
                self.running = previous;
                self.rolled_back = true;
                SimError::SimulatedReboot
            }
            None => SimError::NoUpdatePartition,
        }
    }
}
