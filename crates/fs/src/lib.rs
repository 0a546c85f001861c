pub mod control;
pub mod fs;
pub mod inode;
/**
 * The mount table: storage-id allocation,
 *  path → storage multiplexing, lazy mounts,
 *  pseudo-manifests and remount semantics.
 */
pub mod mount_table;
pub mod remounter;
