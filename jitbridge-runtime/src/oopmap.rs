use std::collections::BTreeMap;

use crate::vmreg::VMReg;

/// What a frame location holds at a safepoint.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OopMapValue {
    /// A managed reference the GC must visit and may update.
    Oop,
    /// The caller's value of the given machine register.
    CalleeSaved(VMReg),
}

/// Locations of interest in one frame at one pc. `frame_size` is in 4-byte
/// slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OopMap {
    frame_size: i32,
    arg_count: i32,
    entries: BTreeMap<VMReg, OopMapValue>,
}

impl OopMap {
    pub fn new(frame_size: i32, arg_count: i32) -> OopMap {
        OopMap {
            frame_size,
            arg_count,
            entries: BTreeMap::new(),
        }
    }

    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    pub fn arg_count(&self) -> i32 {
        self.arg_count
    }

    pub fn set_oop(&mut self, reg: VMReg) {
        self.insert(reg, OopMapValue::Oop);
    }

    pub fn set_callee_saved(&mut self, reg: VMReg, caller_reg: VMReg) {
        self.insert(reg, OopMapValue::CalleeSaved(caller_reg));
    }

    fn insert(&mut self, reg: VMReg, value: OopMapValue) {
        assert!(reg.is_valid());
        let old = self.entries.insert(reg, value);
        assert!(old.is_none(), "{:?} already described in oop map", reg);
    }

    pub fn get(&self, reg: VMReg) -> Option<OopMapValue> {
        self.entries.get(&reg).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (VMReg, OopMapValue)> + '_ {
        self.entries.iter().map(|(&reg, &value)| (reg, value))
    }

    pub fn oops(&self) -> impl Iterator<Item = VMReg> + '_ {
        self.entries()
            .filter(|(_, value)| *value == OopMapValue::Oop)
            .map(|(reg, _)| reg)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// OopMaps of one code blob, keyed by code offset.
#[derive(Clone, Debug, Default)]
pub struct OopMapSet {
    maps: Vec<(u32, OopMap)>,
}

impl OopMapSet {
    pub fn new() -> OopMapSet {
        OopMapSet { maps: Vec::new() }
    }

    pub fn add_gc_map(&mut self, pc_offset: u32, map: OopMap) {
        assert!(
            self.find_map_at_offset(pc_offset).is_none(),
            "second oop map at offset {}",
            pc_offset
        );
        self.maps.push((pc_offset, map));
    }

    pub fn find_map_at_offset(&self, pc_offset: u32) -> Option<&OopMap> {
        self.maps
            .iter()
            .find(|(offset, _)| *offset == pc_offset)
            .map(|(_, map)| map)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &OopMap)> + '_ {
        self.maps.iter().map(|(offset, map)| (*offset, map))
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitbridge_asm::x64::RBX;

    #[test]
    fn test_oop_map() {
        let mut map = OopMap::new(8, 0);
        map.set_oop(VMReg::stack(2));
        map.set_callee_saved(VMReg::stack(4), VMReg::from_register(RBX));

        assert_eq!(map.get(VMReg::stack(2)), Some(OopMapValue::Oop));
        assert_eq!(
            map.get(VMReg::stack(4)),
            Some(OopMapValue::CalleeSaved(VMReg::from_register(RBX)))
        );
        assert_eq!(map.get(VMReg::stack(0)), None);
        assert_eq!(map.oops().collect::<Vec<_>>(), vec![VMReg::stack(2)]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    #[should_panic(expected = "already described")]
    fn test_duplicate_entry() {
        let mut map = OopMap::new(4, 0);
        map.set_oop(VMReg::stack(0));
        map.set_oop(VMReg::stack(0));
    }

    #[test]
    fn test_oop_map_set() {
        let mut set = OopMapSet::new();
        set.add_gc_map(12, OopMap::new(4, 0));
        set.add_gc_map(40, OopMap::new(6, 1));

        assert_eq!(set.find_map_at_offset(40).map(|m| m.frame_size()), Some(6));
        assert!(set.find_map_at_offset(13).is_none());
        assert_eq!(set.len(), 2);
    }
}
