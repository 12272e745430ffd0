//! Boot configuration.

/// Default location of the partition table.  Sector 0 holds the bootloader.
pub const DEFAULT_TABLE_OFFSET: usize = 0x1000;

/// Settings owned by one boot sequence invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    /// Flash offset of the partition table.  Must be sector aligned.
    pub table_offset: usize,
    /// Whether the chip has flash encryption turned on.  When it does, all
    /// application partitions and the OTA data partition are accessed
    /// through the encrypted path, whatever their table flags say.
    pub flash_encryption: bool,
}

impl BootConfig {
    pub const fn new() -> BootConfig {
        BootConfig {
            table_offset: DEFAULT_TABLE_OFFSET,
            flash_encryption: false,
        }
    }

    pub const fn with_table_offset(mut self, offset: usize) -> BootConfig {
        self.table_offset = offset;
        self
    }

    pub const fn with_flash_encryption(mut self, enabled: bool) -> BootConfig {
        self.flash_encryption = enabled;
        self
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig::new()
    }
}
