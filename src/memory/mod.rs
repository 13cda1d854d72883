pub mod allocator;
pub mod fence;
pub mod pattern;
pub mod pattern_cache;
pub mod pattern_planner;
pub mod planner;

pub use allocator::{
    create_default_allocator,
    Allocator,
    AllocatorPtr,
    Buffer,
    CpuAllocator,
    DeviceType,
    MemType,
    MemoryLocation,
    ALLOC_ALIGNMENT,
};

pub use fence::Fence;

pub use pattern::{
    MemPatternPlanner,
    MemoryBlock,
    MemoryPattern,
    MemoryPatternGroup,
};

pub use pattern_cache::{MemoryPatternCache, ShapeSignature};
pub use pattern_planner::ValuePatternPlanner;
pub use planner::AllocationPlanner;
