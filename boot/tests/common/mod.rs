// Shared test fixtures: a recording platform and standard devices.

#![allow(dead_code)]

use std::cell::RefCell;
use std::panic::{catch_unwind, panic_any, AssertUnwindSafe};
use std::rc::Rc;

use simflash::gen::{GeneratedImage, ImageBuilder, StandardLayout};
use simflash::styles::AreaLayout;
use simflash::SimFlash;
use ssbl::platform::{Platform, Reset};
use ssbl::BootConfig;
use storage::{Flash, ReadFlash};

/// RAM the flash controller can fill directly.  Also holds the vectors.
pub const RAM_BASE: u32 = 0x1000_0000;
pub const RAM_SIZE: usize = 0x1_0000;

/// Instruction RAM that must be written through the CPU.
pub const IRAM_BASE: u32 = 0x2000_0000;
pub const IRAM_SIZE: usize = 0x4000;

/// Contents of memory before anything is loaded.
pub const FILL: u8 = 0xa5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Memory { dest: u32, len: usize },
    FlashClosed,
    RestorePads,
    DisableInterrupts,
    FlushIcache,
}

/// How a boot ended.  Carried out of the boot code as a panic payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Jump(u32),
    Reset,
    Halt,
}

pub type Events = Rc<RefCell<Vec<Event>>>;

pub struct MockPlatform {
    pub ram: Vec<u8>,
    pub iram: Vec<u8>,
    pub vector_base: u32,
    pub events: Events,
}

impl MockPlatform {
    pub fn new() -> MockPlatform {
        MockPlatform {
            ram: vec![FILL; RAM_SIZE],
            iram: vec![FILL; IRAM_SIZE],
            vector_base: RAM_BASE,
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Memory contents at an address in either region.
    pub fn peek(&self, addr: u32, len: usize) -> &[u8] {
        if addr >= IRAM_BASE {
            let off = (addr - IRAM_BASE) as usize;
            &self.iram[off..off + len]
        } else {
            let off = (addr - RAM_BASE) as usize;
            &self.ram[off..off + len]
        }
    }
}

impl Reset for MockPlatform {
    fn reset(&mut self) -> ! {
        panic_any(Exit::Reset)
    }
}

impl Platform for MockPlatform {
    fn vector_base(&self) -> u32 {
        self.vector_base
    }

    fn is_loadable(&self, dest: u32, len: usize) -> bool {
        let within = |base: u32, size: usize| dest >= base && (dest - base) as usize + len <= size;
        within(RAM_BASE, RAM_SIZE) || within(IRAM_BASE, IRAM_SIZE)
    }

    fn is_direct(&self, dest: u32, len: usize) -> bool {
        dest >= RAM_BASE && (dest - RAM_BASE) as usize + len <= RAM_SIZE
    }

    unsafe fn memory(&mut self, dest: u32, len: usize) -> &mut [u8] {
        self.push(Event::Memory { dest, len });
        if dest >= IRAM_BASE {
            let off = (dest - IRAM_BASE) as usize;
            &mut self.iram[off..off + len]
        } else {
            let off = (dest - RAM_BASE) as usize;
            &mut self.ram[off..off + len]
        }
    }

    fn restore_pads(&mut self) {
        self.push(Event::RestorePads);
    }

    fn disable_interrupts(&mut self) {
        self.push(Event::DisableInterrupts);
    }

    fn flush_icache(&mut self) {
        self.push(Event::FlushIcache);
    }

    fn halt(&mut self) -> ! {
        panic_any(Exit::Halt)
    }

    unsafe fn jump(&mut self, entry: u32) -> ! {
        panic_any(Exit::Jump(entry))
    }
}

/// Flash that records when it is dropped.
pub struct TrackedFlash<'a> {
    pub flash: &'a mut SimFlash,
    pub events: Events,
}

impl Drop for TrackedFlash<'_> {
    fn drop(&mut self) {
        self.events.borrow_mut().push(Event::FlashClosed);
    }
}

impl ReadFlash for TrackedFlash<'_> {
    fn read_size(&self) -> usize {
        self.flash.read_size()
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        self.flash.read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.flash.capacity()
    }

    fn read_encrypted(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        self.flash.read_encrypted(offset, bytes)
    }
}

impl Flash for TrackedFlash<'_> {
    fn write_size(&self) -> usize {
        self.flash.write_size()
    }

    fn erase_size(&self) -> usize {
        self.flash.erase_size()
    }

    fn erase(&mut self, from: usize, to: usize) -> storage::Result<()> {
        self.flash.erase(from, to)
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        self.flash.write(offset, bytes)
    }

    fn write_encrypted(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        self.flash.write_encrypted(offset, bytes)
    }
}

/// Run `f`, which is expected to leave through one of the platform exits.
pub fn exit_of<F: FnOnce()>(f: F) -> Exit {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => panic!("boot code returned"),
        Err(payload) => match payload.downcast::<Exit>() {
            Ok(exit) => *exit,
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// A flash with the standard partition layout, and distinct images in the
/// factory and both OTA slots.
pub struct Device {
    pub flash: SimFlash,
    pub layout: StandardLayout,
    pub factory: GeneratedImage,
    pub ota: [GeneratedImage; 2],
}

impl Device {
    pub fn new(style: &AreaLayout) -> Device {
        let mut flash = style.build().unwrap();
        let layout = StandardLayout::for_sector(style.erase_size);
        flash
            .install(&layout.table().build().unwrap(), layout.table as usize)
            .unwrap();

        let factory = image(1);
        let ota = [image(2), image(3)];
        flash.install(&factory.data, layout.factory.0 as usize).unwrap();
        flash.install(&ota[0].data, layout.ota[0].0 as usize).unwrap();
        flash.install(&ota[1].data, layout.ota[1].0 as usize).unwrap();

        Device {
            flash,
            layout,
            factory,
            ota,
        }
    }

    pub fn config(&self) -> BootConfig {
        BootConfig::default().with_table_offset(self.layout.table as usize)
    }

    /// Run a complete boot.  Returns how it ended and the platform state.
    pub fn boot(&mut self) -> (Exit, MockPlatform) {
        let mut platform = MockPlatform::new();
        let config = self.config();
        let flash = &mut self.flash;
        let exit = exit_of(|| ssbl::ssbl::boot(config, flash, &mut platform));
        (exit, platform)
    }
}

/// An image with a vector table segment, a direct segment and one that goes
/// through the bounce buffer.
pub fn image(seed: u64) -> GeneratedImage {
    ImageBuilder::default()
        .seed(seed * 16)
        .entry(RAM_BASE + 0x400 + seed as u32)
        .random_segment(RAM_BASE, 0x300)
        .random_segment(RAM_BASE + 0x1000, 0x1234)
        .random_segment(IRAM_BASE, 0x900 + seed as usize)
        .build()
        .unwrap()
}

/// Check that every segment of `image` landed in memory.
pub fn assert_loaded(platform: &MockPlatform, image: &GeneratedImage) {
    for (seg, payload) in image.segments.iter().zip(&image.payloads) {
        assert_eq!(platform.peek(seg.dest, payload.len()), payload.as_slice());
    }
}
