//! Flash persistence for the parameter record.
//!
//! The record lives in the last 4 KiB sector, outside the program image
//! (the linker script excludes it from `FLASH`). Erase and program run
//! with interrupts disabled on this core; core 1 keeps running because the
//! whole modulator loop executes from RAM while XIP is stalled.

use audio::params::{LoadError, Params, MAGIC, RECORD_LEN};
use defmt::{info, warn};
use embassy_rp::flash::{Blocking, Flash, ERASE_SIZE};
use embassy_rp::peripherals::FLASH;
use embassy_rp::Peri;

pub const FLASH_SIZE: usize = 2 * 1024 * 1024;
const STORE_OFFSET: u32 = (FLASH_SIZE - ERASE_SIZE) as u32;

const PAGE_SIZE: usize = 256;
const WRITE_LEN: usize = RECORD_LEN.next_multiple_of(PAGE_SIZE);

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum SaveError {
    Flash,
    Verify,
}

pub struct ParamStore {
    flash: Flash<'static, FLASH, Blocking, FLASH_SIZE>,
}

impl ParamStore {
    pub fn new(flash: Peri<'static, FLASH>) -> Self {
        ParamStore {
            flash: Flash::new_blocking(flash),
        }
    }

    /// Reads and verifies the stored record. Any failure means "no saved
    /// state"; the caller boots with factory defaults.
    pub fn load(&mut self) -> Result<Params, LoadError> {
        let mut record = [0u8; RECORD_LEN];
        self.flash
            .blocking_read(STORE_OFFSET, &mut record)
            .map_err(|_| LoadError::Truncated)?;
        Params::decode(&record)
    }

    /// Erases the sector and programs a fresh record, then verifies the
    /// magic on read-back.
    pub fn save(&mut self, params: &Params) -> Result<(), SaveError> {
        let mut record = [0xFFu8; WRITE_LEN];
        params.encode(&mut record);

        self.flash
            .blocking_erase(STORE_OFFSET, STORE_OFFSET + ERASE_SIZE as u32)
            .map_err(|_| SaveError::Flash)?;
        self.flash
            .blocking_write(STORE_OFFSET, &record)
            .map_err(|_| SaveError::Flash)?;

        let mut verify = [0u8; 4];
        self.flash
            .blocking_read(STORE_OFFSET, &mut verify)
            .map_err(|_| SaveError::Flash)?;
        if u32::from_le_bytes(verify) != MAGIC {
            warn!("Parameter record failed read-back verification");
            return Err(SaveError::Verify);
        }

        info!("Saved {} parameter bytes", RECORD_LEN);
        Ok(())
    }
}
