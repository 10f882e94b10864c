mod common;

use common::Recorder;
use parking_lot::Mutex;
use std::sync::Arc;
use vmm::{
    memory::{AddressSpaceId, FlatRange, MemoryListener, MemoryMap, MemoryRegion, MemorySection},
    VmError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Begin,
    Add(String, u64, u64),
    Del(String, u64, u64),
    Commit,
}

#[derive(Default)]
struct Journal {
    events: Mutex<Vec<Event>>,
}

impl Journal {
    /// Adds and deletes since the last call, in notification order.
    fn changes(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
            .into_iter()
            .filter(|e| matches!(e, Event::Add(..) | Event::Del(..)))
            .collect()
    }
}

impl MemoryListener for Journal {
    fn begin(&self) -> Result<(), VmError> {
        self.events.lock().push(Event::Begin);
        Ok(())
    }

    fn region_add(&self, s: &MemorySection) -> Result<(), VmError> {
        self.events.lock().push(Event::Add(
            s.region.name().to_string(),
            s.offset_within_address_space,
            s.size,
        ));
        Ok(())
    }

    fn region_del(&self, s: &MemorySection) -> Result<(), VmError> {
        self.events.lock().push(Event::Del(
            s.region.name().to_string(),
            s.offset_within_address_space,
            s.size,
        ));
        Ok(())
    }

    fn commit(&self) -> Result<(), VmError> {
        self.events.lock().push(Event::Commit);
        Ok(())
    }
}

fn add(name: &str, start: u64, size: u64) -> Event {
    Event::Add(name.into(), start, size)
}

fn del(name: &str, start: u64, size: u64) -> Event {
    Event::Del(name.into(), start, size)
}

struct Fixture {
    map: MemoryMap,
    root: Arc<MemoryRegion>,
    space: AddressSpaceId,
    journal: Arc<Journal>,
}

fn fixture() -> Fixture {
    let mut map = MemoryMap::new();
    let root = MemoryRegion::new_container("root", u64::MAX);
    let space = map.add_address_space("memory", root.clone()).unwrap();
    let journal = Arc::new(Journal::default());
    map.register_listener(journal.clone(), space).unwrap();
    journal.changes();
    Fixture {
        map,
        root,
        space,
        journal,
    }
}

impl Fixture {
    fn ranges(&self) -> Vec<FlatRange> {
        self.map.space(self.space).unwrap().current().ranges().to_vec()
    }

    fn spans(&self) -> Vec<(String, u64, u64)> {
        self.ranges()
            .iter()
            .map(|r| (r.region.name().to_string(), r.start, r.size))
            .collect()
    }
}

fn assert_sorted_disjoint(ranges: &[FlatRange]) {
    for pair in ranges.windows(2) {
        assert!(pair[0].last() < pair[1].start, "{:?}", ranges);
    }
}

#[test]
fn priority_split_scenario() {
    let mut f = fixture();
    let r1 = MemoryRegion::new_ram("r1", 0x1000);
    f.map.add_child(&f.root, 0, &r1).unwrap();
    assert_eq!(f.journal.changes(), vec![add("r1", 0, 0x1000)]);

    let r2 = MemoryRegion::new_ram("r2", 0x1000);
    f.map.add_child_overlap(&f.root, 0x800, &r2, 1).unwrap();
    assert_eq!(
        f.journal.changes(),
        vec![
            del("r1", 0, 0x1000),
            add("r1", 0, 0x800),
            add("r2", 0x800, 0x1000),
        ]
    );
}

#[test]
fn refresh_is_idempotent() {
    let mut f = fixture();
    let ram = MemoryRegion::new_ram("ram", 0x10000);
    let dev = MemoryRegion::new_io("dev", 0x1000, Box::new(Recorder::default()));
    f.map.add_child(&f.root, 0, &ram).unwrap();
    f.map.add_child_overlap(&f.root, 0x4000, &dev, 1).unwrap();
    f.journal.changes();

    f.map.refresh().unwrap();
    f.map.refresh().unwrap();
    assert!(f.journal.changes().is_empty());
    // Listeners still see the batch boundaries.
    f.map.refresh().unwrap();
    assert_eq!(*f.journal.events.lock(), vec![Event::Begin, Event::Commit]);
}

#[test]
fn rendering_is_sorted_and_disjoint() {
    let mut f = fixture();
    let low = MemoryRegion::new_ram("low", 0x10_0000);
    let bus = MemoryRegion::new_container("bus", 0x1_0000);
    let a = MemoryRegion::new_io("a", 0x3000, Box::new(Recorder::default()));
    let b = MemoryRegion::new_io("b", 0x3000, Box::new(Recorder::default()));
    let high = MemoryRegion::new_ram("high", 0x2000);
    f.map.add_child(&f.root, 0, &low).unwrap();
    f.map.add_child_overlap(&f.root, 0xa_0000, &bus, 2).unwrap();
    f.map.add_child(&bus, 0x1000, &a).unwrap();
    f.map.add_child_overlap(&bus, 0x2000, &b, -1).unwrap();
    f.map.add_child_overlap(&f.root, 0xf_f000, &high, 1).unwrap();

    let ranges = f.ranges();
    assert_sorted_disjoint(&ranges);
    assert_eq!(
        f.spans(),
        vec![
            ("low".into(), 0, 0xa_1000),
            ("a".into(), 0xa_1000, 0x3000),
            ("b".into(), 0xa_4000, 0x1000),
            ("low".into(), 0xa_5000, 0x5_a000),
            ("high".into(), 0xf_f000, 0x2000),
        ]
    );
    // Both pieces of `low` keep their offsets into the region.
    assert_eq!(ranges[3].offset_in_region, 0xa_5000);
}

#[test]
fn disabled_region_hides_subtree() {
    let mut f = fixture();
    let bus = MemoryRegion::new_container("bus", 0x10000);
    let dev = MemoryRegion::new_io("dev", 0x1000, Box::new(Recorder::default()));
    f.map.add_child(&f.root, 0x10000, &bus).unwrap();
    f.map.add_child(&bus, 0, &dev).unwrap();
    assert_eq!(f.journal.changes(), vec![add("dev", 0x10000, 0x1000)]);

    f.map.set_enabled(&bus, false).unwrap();
    assert_eq!(f.journal.changes(), vec![del("dev", 0x10000, 0x1000)]);
    assert!(f.ranges().is_empty());
    assert!(dev.is_enabled());

    f.map.set_enabled(&bus, true).unwrap();
    assert_eq!(f.journal.changes(), vec![add("dev", 0x10000, 0x1000)]);
}

#[test]
fn higher_priority_backs_overlap() {
    let mut f = fixture();
    let p1 = MemoryRegion::new_ram("p1", 0x2000);
    let p2 = MemoryRegion::new_ram("p2", 0x2000);
    // The lower priority region is attached last, yet stays behind.
    f.map.add_child_overlap(&f.root, 0x1000, &p1, 5).unwrap();
    f.map.add_child_overlap(&f.root, 0, &p2, 3).unwrap();
    assert_eq!(
        f.spans(),
        vec![("p2".into(), 0, 0x1000), ("p1".into(), 0x1000, 0x2000)]
    );

    // Among equal priorities the newest wins.
    let p3 = MemoryRegion::new_ram("p3", 0x1000);
    f.map.add_child_overlap(&f.root, 0x2000, &p3, 5).unwrap();
    assert_eq!(f.ranges()[1].region.name(), "p1");
    assert_eq!(f.ranges()[2].region.name(), "p3");
}

#[test]
fn add_then_remove_restores_rendering() {
    let mut f = fixture();
    let ram = MemoryRegion::new_ram("ram", 0x8000);
    let rom = MemoryRegion::new_rom("rom", 0x1000, Box::new(Recorder::default()));
    f.map.add_child(&f.root, 0, &ram).unwrap();
    f.map.add_child_overlap(&f.root, 0x6000, &rom, 1).unwrap();
    let before = f.ranges();
    f.journal.changes();

    let dev = MemoryRegion::new_io("dev", 0x3000, Box::new(Recorder::default()));
    f.map.add_child_overlap(&f.root, 0x2000, &dev, 2).unwrap();
    assert_ne!(f.ranges(), before);
    f.map.remove_child(&f.root, &dev).unwrap();

    assert_eq!(f.ranges(), before);
    assert!(dev.parent().is_none());
    let changes = f.journal.changes();
    assert!(changes.contains(&del("dev", 0x2000, 0x3000)));
    assert!(changes.contains(&add("ram", 0, 0x6000)));
}

#[test]
fn set_address_waits_for_refresh() {
    let mut f = fixture();
    let dev = MemoryRegion::new_io("dev", 0x1000, Box::new(Recorder::default()));
    f.map.add_child(&f.root, 0x1000, &dev).unwrap();
    f.journal.changes();

    f.map.set_address(&dev, 0x5000);
    assert_eq!(dev.addr(), 0x5000);
    assert!(f.journal.changes().is_empty());
    assert_eq!(f.ranges()[0].start, 0x1000);

    f.map.refresh().unwrap();
    assert_eq!(
        f.journal.changes(),
        vec![del("dev", 0x1000, 0x1000), add("dev", 0x5000, 0x1000)]
    );
}

#[test]
fn alias_renders_its_target() {
    let mut f = fixture();
    let ram = MemoryRegion::new_ram("ram", 0x10000);
    let window = MemoryRegion::new_alias("window", &ram, 0x4000, 0x2000);
    f.map.add_child(&f.root, 0, &ram).unwrap();
    f.map.add_child_overlap(&f.root, 0x2_0000, &window, 1).unwrap();
    let r = f.ranges().into_iter().find(|r| r.start == 0x2_0000).unwrap();
    assert_eq!(r.region.name(), "ram");
    assert_eq!(r.offset_in_region, 0x4000);
    assert_eq!(r.size, 0x2000);

    // Both views reach the same bytes.
    let mut buf = *b"alias!";
    assert!(f.map.rw(f.space, 0x2_0010, &mut buf, true));
    let mut back = [0u8; 6];
    assert!(f.map.rw(f.space, 0x4010, &mut back, false));
    assert_eq!(&back, b"alias!");

    f.map.set_alias_offset(&window, 0x8000).unwrap();
    let section = f.map.find(f.space, 0x2_0010, 4).unwrap();
    assert_eq!(section.offset_within_region, 0x8010);
    assert_eq!(section.size, 4);
}

#[test]
fn rw_dispatches_to_devices() {
    let mut f = fixture();
    let ram = MemoryRegion::new_ram("ram", 0x1000);
    let recorder = Recorder {
        value: 0x1122_3344,
        ..Default::default()
    };
    let dev = MemoryRegion::new_io("dev", 0x100, Box::new(recorder.clone()));
    f.map.add_child(&f.root, 0, &ram).unwrap();
    f.map.add_child(&f.root, 0x1000, &dev).unwrap();

    // A write straddling RAM and the device.
    let mut buf = [0xaa, 0xbb, 0xcc, 0xdd];
    assert!(f.map.rw(f.space, 0xffe, &mut buf, true));
    assert_eq!(
        *recorder.log.lock(),
        vec![(0, 2, Some(0xddcc))]
    );
    let mut low = [0u8; 2];
    assert!(f.map.rw(f.space, 0xffe, &mut low, false));
    assert_eq!(low, [0xaa, 0xbb]);

    // Eight bytes go out as two 4-byte accesses.
    recorder.log.lock().clear();
    let mut wide = [0u8; 8];
    assert!(f.map.rw(f.space, 0x1008, &mut wide, false));
    assert_eq!(*recorder.log.lock(), vec![(8, 4, None), (12, 4, None)]);
    assert_eq!(u64::from_le_bytes(wide), 0x1122_3344_1122_3344);

    // Nothing lives past the device.
    let mut hole = [0xffu8; 4];
    assert!(!f.map.rw(f.space, 0x2000, &mut hole, false));
    assert_eq!(hole, [0; 4]);
}

#[test]
fn default_ops_reject_everything() {
    let mut f = fixture();
    let dev = MemoryRegion::new_io("dead", 0x10, Box::new(vmm::memory::RejectAll));
    f.map.add_child(&f.root, 0x3000, &dev).unwrap();
    let mut buf = [0x5au8; 4];
    assert!(!f.map.rw(f.space, 0x3000, &mut buf, false));
    assert_eq!(buf, [0; 4]);
    assert!(!f.map.rw(f.space, 0x3000, &mut buf, true));
}

#[test]
fn zero_sized_regions_vanish() {
    let mut f = fixture();
    let empty = MemoryRegion::new_ram("empty", 0x1000);
    f.map.add_child(&f.root, 0, &empty).unwrap();
    f.journal.changes();
    f.map.set_size(&empty, 0).unwrap();
    assert_eq!(f.journal.changes(), vec![del("empty", 0, 0x1000)]);
    assert!(f.ranges().is_empty());
}

#[test]
fn listeners_only_see_their_space() {
    let mut f = fixture();
    let io_root = MemoryRegion::new_container("io", 0x1_0000);
    let io = f.map.add_address_space("io", io_root.clone()).unwrap();
    let port = MemoryRegion::new_io("port", 4, Box::new(Recorder::default()));
    f.map.add_child(&io_root, 0x60, &port).unwrap();
    assert!(f.journal.changes().is_empty());

    let late = Arc::new(Journal::default());
    f.map.register_listener(late.clone(), io).unwrap();
    assert_eq!(late.changes(), vec![add("port", 0x60, 4)]);

    f.map.destroy_address_space(io).unwrap();
    assert_eq!(late.changes(), vec![del("port", 0x60, 4)]);
    assert!(f.map.space(io).is_none());
}

#[test]
fn readonly_is_reported() {
    let mut f = fixture();
    let ram = MemoryRegion::new_ram("ram", 0x1000);
    f.map.add_child(&f.root, 0, &ram).unwrap();
    f.journal.changes();
    f.map.set_readonly(&ram, true).unwrap();
    assert!(f.ranges()[0].readonly);
    assert_eq!(
        f.journal.changes(),
        vec![del("ram", 0, 0x1000), add("ram", 0, 0x1000)]
    );
}
