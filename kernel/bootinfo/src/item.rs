/// Classification of a range of physical memory reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryKind {
    /// Memory that is unusable for an unspecified reason.
    Reserved = 0,
    /// Ordinary RAM, free for kernel use.
    Usable = 1,
    /// Memory holding firmware boot-services data, reclaimable once boot data has been consumed.
    FirmwareBoot = 2,
    /// Memory owned by runtime firmware services for the lifetime of the system.
    FirmwareRuntime = 3,
    /// Memory holding ACPI tables.
    AcpiTables = 4,
    /// Memory reported as defective or otherwise never safe to touch.
    Unusable = 5,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryRange {
    pub start_frame: usize,
    pub frame_count: usize,
    pub kind: MemoryKind,
}
