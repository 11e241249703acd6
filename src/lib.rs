//! Live full and incremental backups of running QEMU instances.
//!
//! Drives the QMP monitor socket to create persistent dirty bitmaps and
//! copy-before-write fleecing topologies, launches block backup jobs and
//! reconstructs usable images from the resulting backup chains.

pub mod api_types;
pub mod backup;
pub mod blockdev;
pub mod image;
pub mod layout;
pub mod qga;
pub mod qmp;
pub mod restore;
pub mod tools;
