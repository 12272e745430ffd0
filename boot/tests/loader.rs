// Segment loading and the hand-off.

mod common;

use common::{exit_of, image, Event, Exit, MockPlatform, TrackedFlash, FILL, IRAM_BASE, RAM_BASE};
use simflash::gen::{codes, ImageBuilder, TableBuilder};
use simflash::styles::SPI_FLASH;
use simflash::SimFlash;
use ssbl::image::{Image, COPY_CHUNK, MAX_SEGMENTS, VECTOR_BLOCK_SIZE};
use ssbl::{BootConfig, Error, Partition, PartitionKind, Registry, Subtype};

const APP_OFFSET: u32 = 0x10000;
const APP_SIZE: u32 = 0x10000;

/// A flash with a single application partition holding `data`.
fn flash_with(data: &[u8]) -> (SimFlash, Partition) {
    let mut flash = SPI_FLASH.build().unwrap();
    let mut t = TableBuilder::default();
    t.entry(codes::APP, codes::FACTORY, "factory", APP_OFFSET, APP_SIZE);
    flash.install(&t.build().unwrap(), 0x1000).unwrap();
    flash.install(data, APP_OFFSET as usize).unwrap();

    let registry = Registry::new(BootConfig::default());
    let part = registry
        .find_first(&mut flash, PartitionKind::App, Subtype::FACTORY, None)
        .unwrap()
        .unwrap();
    (flash, part)
}

#[test]
fn segments_are_copied() {
    let img = image(4);
    let (mut flash, part) = flash_with(&img.data);
    let image = Image::from_partition(&mut flash, &part).unwrap();
    assert_eq!(image.entry(), img.entry);
    assert_eq!(image.segments().len(), 3);
    assert_eq!(image.segments()[1].dest, RAM_BASE + 0x1000);

    let mut platform = MockPlatform::new();
    let loaded = image.load(&mut flash, &mut platform).unwrap();
    assert_eq!(loaded.entry(), img.entry);

    // Everything but the vector block is in place.
    assert_eq!(platform.peek(RAM_BASE, VECTOR_BLOCK_SIZE), &[FILL; VECTOR_BLOCK_SIZE][..]);
    assert_eq!(
        platform.peek(RAM_BASE + VECTOR_BLOCK_SIZE as u32, 0x200),
        &img.payloads[0][VECTOR_BLOCK_SIZE..]
    );
    assert_eq!(platform.peek(RAM_BASE + 0x1000, 0x1234), img.payloads[1].as_slice());
    assert_eq!(platform.peek(IRAM_BASE, img.payloads[2].len()), img.payloads[2].as_slice());
}

#[test]
fn bounce_buffer_chunks() {
    let size = 2 * COPY_CHUNK + 100;
    let mut b = ImageBuilder::default();
    b.random_segment(IRAM_BASE + 0x10, size);
    let img = b.build().unwrap();
    let (mut flash, part) = flash_with(&img.data);

    let mut platform = MockPlatform::new();
    Image::from_partition(&mut flash, &part)
        .unwrap()
        .load(&mut flash, &mut platform)
        .unwrap();

    let chunks: Vec<_> = platform
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Memory { dest, len } => Some((dest - IRAM_BASE, len)),
            _ => None,
        })
        .collect();
    assert_eq!(
        chunks,
        [
            (0x10, COPY_CHUNK),
            (0x10 + COPY_CHUNK as u32, COPY_CHUNK),
            (0x10 + 2 * COPY_CHUNK as u32, 100)
        ]
    );
    assert_eq!(platform.peek(IRAM_BASE + 0x10, size), img.payloads[0].as_slice());
}

#[test]
fn launch_order() {
    let img = image(5);
    let (mut flash, part) = flash_with(&img.data);
    let mut platform = MockPlatform::new();

    let mut tracked = TrackedFlash {
        flash: &mut flash,
        events: platform.events.clone(),
    };
    let loaded = Image::from_partition(&mut tracked, &part)
        .unwrap()
        .load(&mut tracked, &mut platform)
        .unwrap();
    let exit = exit_of(|| loaded.launch(tracked, &mut platform));
    assert_eq!(exit, Exit::Jump(img.entry));

    let events = platform.events();
    let closed = events.iter().position(|e| *e == Event::FlashClosed).unwrap();
    assert_eq!(
        &events[closed..],
        &[
            Event::FlashClosed,
            Event::RestorePads,
            Event::DisableInterrupts,
            Event::Memory {
                dest: RAM_BASE,
                len: VECTOR_BLOCK_SIZE
            },
            Event::FlushIcache,
        ]
    );
    assert_eq!(platform.peek(RAM_BASE, 0x300), img.payloads[0].as_slice());
}

#[test]
fn short_vector_segment() {
    let mut b = ImageBuilder::default();
    b.segment(RAM_BASE, &[1, 2, 3, 4]).segment(RAM_BASE + 0x100, &[5; 8]);
    let img = b.build().unwrap();
    let (mut flash, part) = flash_with(&img.data);

    let mut platform = MockPlatform::new();
    let loaded = Image::from_partition(&mut flash, &part)
        .unwrap()
        .load(&mut flash, &mut platform)
        .unwrap();
    assert_eq!(platform.peek(RAM_BASE, 4), &[FILL; 4]);
    assert_eq!(platform.peek(RAM_BASE + 0x100, 8), &[5; 8]);

    let exit = exit_of(|| loaded.launch((), &mut platform));
    assert_eq!(exit, Exit::Jump(img.entry));
    assert_eq!(platform.peek(RAM_BASE, 5), &[1, 2, 3, 4, FILL]);
}

#[test]
fn too_many_segments() {
    let mut b = ImageBuilder::default();
    for i in 0..=MAX_SEGMENTS as u32 {
        b.segment(RAM_BASE + 0x1000 + i * 0x10, &[i as u8; 4]);
    }
    let img = b.build().unwrap();
    let (mut flash, part) = flash_with(&img.data);
    assert_eq!(
        Image::from_partition(&mut flash, &part).unwrap_err(),
        Error::CorruptImage
    );

    // Exactly the limit is fine.
    let mut b = ImageBuilder::default();
    for i in 0..MAX_SEGMENTS as u32 {
        b.segment(RAM_BASE + 0x1000 + i * 0x10, &[i as u8; 4]);
    }
    let img = b.build().unwrap();
    let (mut flash, part) = flash_with(&img.data);
    assert_eq!(
        Image::from_partition(&mut flash, &part).unwrap().segments().len(),
        MAX_SEGMENTS
    );
}

#[test]
fn segment_outside_memory() {
    for dest in [0x3000_0000, IRAM_BASE - 4, IRAM_BASE + 0x3ffc] {
        let mut b = ImageBuilder::default();
        b.segment(RAM_BASE + 0x100, &[1; 8]).segment(dest, &[2; 8]);
        let img = b.build().unwrap();
        let (mut flash, part) = flash_with(&img.data);

        let mut platform = MockPlatform::new();
        let image = Image::from_partition(&mut flash, &part).unwrap();
        assert_eq!(
            image.load(&mut flash, &mut platform).unwrap_err(),
            Error::CorruptImage
        );
        // Not even the good segment was touched.
        assert!(platform.events().is_empty());
    }
}

#[test]
fn segment_outside_partition() {
    let mut img = image(6);
    // Point the last segment past the end of the partition.
    let base = 8 + 2 * 12;
    img.data[base..base + 4].copy_from_slice(&(APP_SIZE - 4).to_le_bytes());
    let (mut flash, part) = flash_with(&img.data);
    assert_eq!(
        Image::from_partition(&mut flash, &part).unwrap_err(),
        Error::CorruptImage
    );
}
