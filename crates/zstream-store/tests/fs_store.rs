use std::path::PathBuf;

use anyhow::Result;

use zstream_core::{ChunkGrid, ChunkKey};
use zstream_store::{ChunkStore, FsChunkStore};

fn temp_dir(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "zstream-store-{test_name}-{}-{}",
        std::process::id(),
        zstream_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

#[test]
fn written_chunks_read_back_through_open() -> Result<()> {
    let root = temp_dir("roundtrip")?.join("array.zarr");
    let grid = ChunkGrid::new(vec![8, 4], vec![4, 4], 2)?;
    let created = FsChunkStore::create(&root, grid.clone())?;
    let chunk: Vec<u8> = (0..32u8).collect();
    created.write_chunk(ChunkKey(1), &chunk)?;

    let opened = FsChunkStore::open(&root)?;
    assert_eq!(opened.grid(), &grid);
    assert!(root.join("1.0").exists());
    let got = opened.fetch(ChunkKey(1))?;
    assert_eq!(&got[..], &chunk[..]);
    Ok(())
}

#[test]
fn missing_chunk_file_is_not_found() -> Result<()> {
    let root = temp_dir("missing")?;
    let store = FsChunkStore::create(&root, ChunkGrid::new(vec![8], vec![4], 1)?)?;
    let err = store.fetch(ChunkKey(0)).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.key(), ChunkKey(0));
    Ok(())
}

#[test]
fn key_outside_grid_is_not_found() -> Result<()> {
    let root = temp_dir("outside")?;
    let store = FsChunkStore::create(&root, ChunkGrid::new(vec![8], vec![4], 1)?)?;
    assert!(store.fetch(ChunkKey(2)).unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn truncated_chunk_is_a_transient_failure() -> Result<()> {
    let root = temp_dir("truncated")?;
    let store = FsChunkStore::create(&root, ChunkGrid::new(vec![8], vec![4], 1)?)?;
    std::fs::write(root.join("0"), [1u8, 2])?;
    let err = store.fetch(ChunkKey(0)).unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.to_string().contains("expected 4"));
    Ok(())
}

#[test]
fn write_chunk_rejects_wrong_size() -> Result<()> {
    let root = temp_dir("wrong-size")?;
    let store = FsChunkStore::create(&root, ChunkGrid::new(vec![8], vec![4], 1)?)?;
    assert!(store.write_chunk(ChunkKey(0), &[0u8; 3]).is_err());
    Ok(())
}

#[test]
fn open_dispatches_local_paths() -> Result<()> {
    let root = temp_dir("open-dispatch")?;
    let grid = ChunkGrid::new(vec![6], vec![3], 1)?;
    let store = FsChunkStore::create(&root, grid.clone())?;
    store.write_chunk(ChunkKey(0), &[7, 8, 9])?;

    let root_str = root
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("non-utf8 temp dir"))?;
    let opened = zstream_store::open(root_str)?;
    assert_eq!(opened.grid, grid);
    assert_eq!(&opened.store.fetch(ChunkKey(0))?[..], &[7, 8, 9]);
    Ok(())
}
