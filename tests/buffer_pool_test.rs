//! Integration tests for the buffer pool manager

use std::sync::Arc;
use std::thread;

use rand::seq::SliceRandom;
use rand::thread_rng;
use strata::buffer::BufferPoolManager;
use strata::common::{PageId, StrataError, INVALID_PAGE_ID};
use strata::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = BufferPoolManager::new(pool_size, 2, dm);
    (bpm, temp_file)
}

#[test]
fn test_buffer_pool_basic_operations() {
    let (bpm, _temp) = create_bpm(10);

    // Page 0 is the header page, so the first data page is 1
    let page_id = bpm.new_page().unwrap();
    assert_eq!(page_id, PageId::new(1));
    assert_eq!(bpm.get_pin_count(page_id), Some(1));
    assert!(bpm.unpin_page(page_id, false));

    {
        let mut guard = bpm.fetch_page_write(page_id).unwrap();
        guard.data_mut()[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
    }

    {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard.data()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    assert_eq!(bpm.get_pin_count(page_id), Some(0));
}

#[test]
fn test_buffer_pool_persistence() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let page_id;
    let test_data = b"Persistence test data";

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        let mut guard = bpm.new_page_guarded().unwrap();
        page_id = guard.page_id();
        guard.data_mut()[..test_data.len()].copy_from_slice(test_data);
        drop(guard);

        assert!(bpm.flush_page(page_id).unwrap());
    }

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard.data()[..test_data.len()], test_data);
    }
}

#[test]
fn test_buffer_pool_eviction_writes_back() {
    let (bpm, _temp) = create_bpm(3);

    let mut page_ids = Vec::new();
    for i in 0..3 {
        let mut guard = bpm.new_page_guarded().unwrap();
        guard.data_mut()[0] = i as u8;
        page_ids.push(guard.page_id());
    }
    assert_eq!(bpm.free_frame_count(), 0);
    for &pid in &page_ids {
        assert_eq!(bpm.get_pin_count(pid), Some(0));
    }

    // A fourth page forces one of the dirty pages out
    let new_pid = bpm.new_page().unwrap();
    assert_eq!(new_pid, PageId::new(4));
    assert!(bpm.unpin_page(new_pid, false));

    for (i, &pid) in page_ids.iter().enumerate() {
        let guard = bpm.fetch_page_read(pid).unwrap();
        assert_eq!(guard.data()[0], i as u8);
    }
}

#[test]
fn test_buffer_pool_pin_prevents_eviction() {
    let (bpm, _temp) = create_bpm(2);

    let pid1 = bpm.new_page().unwrap();
    let pid2 = bpm.new_page().unwrap();

    // Both frames stay pinned from new_page
    assert!(matches!(bpm.new_page(), Err(StrataError::BufferPoolFull)));
    assert!(matches!(
        bpm.fetch_page_read(PageId::new(7)),
        Err(StrataError::BufferPoolFull)
    ));

    assert!(bpm.unpin_page(pid1, false));
    assert!(!bpm.unpin_page(pid1, false));
    let pid3 = bpm.new_page().unwrap();
    assert_eq!(bpm.get_pin_count(pid1), None);

    assert!(bpm.unpin_page(pid2, false));
    assert!(bpm.unpin_page(pid3, false));
    assert_eq!(bpm.pinned_frame_count(), 0);
}

#[test]
fn test_buffer_pool_unpin_keeps_dirty_flag() {
    let (bpm, _temp) = create_bpm(2);

    let pid = bpm.new_page().unwrap();
    let frame = bpm.fetch_page(pid).unwrap();
    assert_eq!(frame.pin_count(), 2);

    assert!(bpm.unpin_page(pid, true));
    // A clean unpin must not clear the earlier dirty mark
    assert!(bpm.unpin_page(pid, false));
    assert!(frame.is_dirty());

    assert!(bpm.flush_page(pid).unwrap());
    assert!(!frame.is_dirty());
    assert!(!bpm.flush_page(PageId::new(99)).unwrap());
    assert!(!bpm.unpin_page(PageId::new(99), false));
}

#[test]
fn test_buffer_pool_delete_page() {
    let (bpm, _temp) = create_bpm(10);

    let pid = {
        let mut guard = bpm.new_page_guarded().unwrap();
        guard.data_mut()[0] = 42;
        guard.page_id()
    };
    let free_before = bpm.free_frame_count();

    assert!(bpm.delete_page(pid).unwrap());
    assert_eq!(bpm.get_pin_count(pid), None);
    assert_eq!(bpm.free_frame_count(), free_before + 1);

    // Not resident: nothing to do
    assert!(bpm.delete_page(pid).unwrap());

    // The freed page id is handed out again
    let reused = bpm.new_page().unwrap();
    assert_eq!(reused, pid);
}

#[test]
fn test_buffer_pool_cannot_delete_pinned_page() {
    let (bpm, _temp) = create_bpm(10);

    let pid = bpm.new_page().unwrap();
    assert!(!bpm.delete_page(pid).unwrap());
    assert_eq!(bpm.get_pin_count(pid), Some(1));

    bpm.unpin_page(pid, false);
    assert!(bpm.delete_page(pid).unwrap());
}

#[test]
fn test_buffer_pool_invalid_page_id() {
    let (bpm, _temp) = create_bpm(2);
    assert!(matches!(
        bpm.fetch_page(INVALID_PAGE_ID),
        Err(StrataError::InvalidPageId(_))
    ));
    assert_eq!(bpm.free_frame_count(), 2);
}

#[test]
fn test_buffer_pool_flush_all() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let page_ids;

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        page_ids = (0..5)
            .map(|i| {
                let mut guard = bpm.new_page_guarded().unwrap();
                guard.data_mut()[0] = i as u8;
                guard.page_id()
            })
            .collect::<Vec<_>>();

        bpm.flush_all_pages().unwrap();
    }

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        for (i, &pid) in page_ids.iter().enumerate() {
            let guard = bpm.fetch_page_read(pid).unwrap();
            assert_eq!(guard.data()[0], i as u8);
        }
    }
}

#[test]
fn test_buffer_pool_concurrent_access() {
    let (bpm, _temp) = create_bpm(10);
    let bpm = Arc::new(bpm);

    let page_id = bpm.new_page_guarded().unwrap().page_id();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut guard = bpm.fetch_page_write(page_id).unwrap();
                    let counter = u32::from_le_bytes(guard.data()[..4].try_into().unwrap());
                    guard.data_mut()[..4].copy_from_slice(&(counter + 1).to_le_bytes());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let guard = bpm.fetch_page_read(page_id).unwrap();
    assert_eq!(u32::from_le_bytes(guard.data()[..4].try_into().unwrap()), 400);
}

#[test]
fn test_buffer_pool_large_workload() {
    let (bpm, _temp) = create_bpm(5); // Small pool to force evictions

    let mut page_ids: Vec<_> = (0..20)
        .map(|_| bpm.new_page_guarded().unwrap().page_id())
        .collect();

    for &pid in &page_ids {
        let mut guard = bpm.fetch_page_write(pid).unwrap();
        guard.data_mut()[..4].copy_from_slice(&pid.as_u32().to_le_bytes());
    }

    page_ids.shuffle(&mut thread_rng());
    for &pid in &page_ids {
        let guard = bpm.fetch_page_read(pid).unwrap();
        let id_bytes: [u8; 4] = guard.data()[..4].try_into().unwrap();
        assert_eq!(u32::from_le_bytes(id_bytes), pid.as_u32());
    }
    assert_eq!(bpm.pinned_frame_count(), 0);
}
