//! Two-tier content fingerprinting for change detection.
//!
//! Tier one is a cheap `stat()` forming a [`MetadataKey`]; a cache hit on
//! that key avoids reading the file entirely. Tier two, on a cache miss,
//! reads (or memory-maps, above 64 KiB) the file and computes a CRC-32C
//! (Castagnoli) fingerprint, then records the metadata-key → fingerprint
//! association for next time.
//!
//! CRC-32C is deliberately not a cryptographic digest: collision
//! resistance is not a security requirement here, only change-detection
//! fidelity, and the Castagnoli table is roughly an order of magnitude
//! faster to compute than a hash like SHA-256.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use crc::{Crc, CRC_32_ISCSI};

use crate::cache::LruTtlCache;
use crate::types::ComponentDescriptor;

/// CRC-32C (Castagnoli). `CRC_32_ISCSI` is this crate's name for the same
/// polynomial table used by iSCSI, SSE4.2's `crc32` instruction, and ext4.
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Files larger than this are memory-mapped instead of read in one call.
const MMAP_THRESHOLD_BYTES: u64 = 64 * 1024;

/// The cheap `path | mtime-seconds | size-bytes` composite used to look up
/// a cached fingerprint without reading file content.
pub fn metadata_key(path: &Path, mtime_unix_secs: u64, size_bytes: u64) -> String {
    format!("{}|{}|{}", path.display(), mtime_unix_secs, size_bytes)
}

/// Computes (or retrieves from cache) the content fingerprint for a
/// descriptor's source file.
///
/// On any I/O failure — the path does not exist, is unreadable, or its
/// metadata cannot be read — this degrades to a stable fallback string
/// (the path itself, or `path:mtime`) rather than returning an error: the
/// caller never sees an exception from this component, per spec.
pub fn fingerprint(descriptor: &ComponentDescriptor, cache: &LruTtlCache) -> String {
    let path = &descriptor.source_path;
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return path.display().to_string(),
    };

    let mtime_secs = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    let size = metadata.len();

    let mtime_secs = match mtime_secs {
        Some(m) => m,
        None => return format!("{}:{}", path.display(), size),
    };

    let key = metadata_key(path, mtime_secs, size);

    if let Some(cached) = cache.get_hash(&key) {
        return cached;
    }

    let fp = match read_and_hash(path) {
        Ok(fp) => fp,
        Err(_) => format!("{}:{}", path.display(), mtime_secs),
    };

    cache.set_hash(&key, &fp);
    fp
}

/// Computes fingerprints for many descriptors.
///
/// First pass: `stat` + cache lookup for every descriptor, with no file
/// I/O — this separates hits from misses cheaply. Second pass: misses are
/// resolved sequentially when there are few of them (≤5), or concurrently
/// (bounded to 8 threads) above that, since spinning up threads is not
/// worth it for a handful of files.
pub fn fingerprint_batch(
    descriptors: &[std::sync::Arc<ComponentDescriptor>],
    cache: &LruTtlCache,
) -> std::collections::HashMap<String, String> {
    const CONCURRENCY_CAP: usize = 8;
    const SEQUENTIAL_THRESHOLD: usize = 5;

    let mut results = std::collections::HashMap::with_capacity(descriptors.len());
    let mut misses: Vec<&std::sync::Arc<ComponentDescriptor>> = Vec::new();

    for descriptor in descriptors {
        match stat_and_lookup(descriptor, cache) {
            Some(fp) => {
                results.insert(descriptor.name.clone(), fp);
            }
            None => misses.push(descriptor),
        }
    }

    if misses.len() <= SEQUENTIAL_THRESHOLD {
        for descriptor in misses {
            results.insert(descriptor.name.clone(), fingerprint(descriptor, cache));
        }
        return results;
    }

    std::thread::scope(|scope| {
        let chunk_size = misses.len().div_ceil(CONCURRENCY_CAP).max(1);
        let mut handles = Vec::new();
        for chunk in misses.chunks(chunk_size) {
            let cache = &*cache;
            handles.push(scope.spawn(move || {
                chunk
                    .iter()
                    .map(|d| (d.name.clone(), fingerprint(d, cache)))
                    .collect::<Vec<_>>()
            }));
        }
        for handle in handles {
            for (name, fp) in handle.join().expect("fingerprint worker panicked") {
                results.insert(name, fp);
            }
        }
    });

    results
}

/// Returns `Some(fingerprint)` if the metadata-keyed cache already has an
/// answer, without touching file content. Returns `None` on a cache miss
/// *or* if stat fails (the caller's fallback path handles both the same
/// way via [`fingerprint`]).
fn stat_and_lookup(descriptor: &ComponentDescriptor, cache: &LruTtlCache) -> Option<String> {
    let metadata = std::fs::metadata(&descriptor.source_path).ok()?;
    let mtime_secs = metadata
        .modified()
        .ok()?
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()?
        .as_secs();
    let key = metadata_key(&descriptor.source_path, mtime_secs, metadata.len());
    cache.get_hash(&key)
}

fn read_and_hash(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    let bytes = if len > MMAP_THRESHOLD_BYTES {
        match read_via_mmap(&file) {
            Ok(bytes) => bytes,
            Err(_) => read_fully(file)?,
        }
    } else {
        read_fully(file)?
    };

    let digest = CASTAGNOLI.checksum(&bytes);
    Ok(format!("{digest:x}"))
}

fn read_via_mmap(file: &File) -> std::io::Result<Vec<u8>> {
    // Safety discipline lives entirely inside `memmap2`: we copy the bytes
    // out immediately and let the mapping drop at the end of this function,
    // so no live mapping survives across fingerprint calls.
    let mmap = unsafe { memmap2::Mmap::map(file)? };
    Ok(mmap.to_vec())
}

fn read_fully(mut file: File) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn descriptor_for(path: std::path::PathBuf) -> ComponentDescriptor {
        ComponentDescriptor {
            name: "widget".to_string(),
            source_path: path,
            package: "pkg".to_string(),
            params: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_missing_file_falls_back_to_path() {
        let cache = LruTtlCache::new(1024, Duration::from_secs(60));
        let descriptor = descriptor_for(std::path::PathBuf::from("/no/such/path/here.tmpl"));
        let fp = fingerprint(&descriptor, &cache);
        assert_eq!(fp, descriptor.source_path.display().to_string());
    }

    #[test]
    fn test_unchanged_file_yields_stable_fingerprint_and_second_call_reads_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.tmpl");
        std::fs::write(&path, b"hello world").expect("write");
        let cache = LruTtlCache::new(1024 * 1024, Duration::from_secs(60));
        let descriptor = descriptor_for(path.clone());

        let first = fingerprint(&descriptor, &cache);
        let second = fingerprint(&descriptor, &cache);
        assert_eq!(first, second);

        // The metadata-key cache entry must exist after the first call so
        // the second call is a pure cache hit.
        let metadata = std::fs::metadata(&path).unwrap();
        let mtime = metadata
            .modified()
            .unwrap()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let key = metadata_key(&path, mtime, metadata.len());
        assert!(cache.get_hash(&key).is_some());
    }

    #[test]
    fn test_modified_file_yields_different_fingerprint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.tmpl");
        std::fs::write(&path, b"version one").expect("write");
        let cache = LruTtlCache::new(1024 * 1024, Duration::from_secs(60));
        let descriptor = descriptor_for(path.clone());

        let before = fingerprint(&descriptor, &cache);

        // Force a distinct mtime: some filesystems have 1s mtime resolution.
        std::thread::sleep(Duration::from_millis(1100));
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        f.write_all(b"version two, much longer than the first").unwrap();
        f.sync_all().unwrap();
        drop(f);

        let after = fingerprint(&descriptor, &cache);
        assert_ne!(before, after);
    }

    #[test]
    fn test_large_file_above_mmap_threshold_hashes_correctly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.tmpl");
        let content = vec![b'x'; (MMAP_THRESHOLD_BYTES as usize) + 1024];
        std::fs::write(&path, &content).expect("write");
        let cache = LruTtlCache::new(8 * 1024 * 1024, Duration::from_secs(60));
        let descriptor = descriptor_for(path);

        let fp = fingerprint(&descriptor, &cache);
        let expected = format!("{:x}", CASTAGNOLI.checksum(&content));
        assert_eq!(fp, expected);
    }

    #[test]
    fn test_concurrent_fingerprint_calls_on_unchanged_file_agree() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shared.tmpl");
        std::fs::write(&path, b"stable content").expect("write");
        let cache = Arc::new(LruTtlCache::new(1024 * 1024, Duration::from_secs(60)));
        let descriptor = Arc::new(descriptor_for(path));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let descriptor = Arc::clone(&descriptor);
                std::thread::spawn(move || {
                    (0..25).map(|_| fingerprint(&descriptor, &cache)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all_fingerprints = Vec::new();
        for h in handles {
            all_fingerprints.extend(h.join().unwrap());
        }
        let first = &all_fingerprints[0];
        assert!(all_fingerprints.iter().all(|fp| fp == first));
    }

    #[test]
    fn test_fingerprint_batch_matches_individual_calls() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut descriptors = Vec::new();
        for i in 0..12 {
            let path = dir.path().join(format!("c{i}.tmpl"));
            std::fs::write(&path, format!("content {i}")).unwrap();
            descriptors.push(Arc::new(ComponentDescriptor {
                name: format!("c{i}"),
                source_path: path,
                package: "pkg".to_string(),
                params: Vec::new(),
            }));
        }
        let cache = LruTtlCache::new(8 * 1024 * 1024, Duration::from_secs(60));
        let batch = fingerprint_batch(&descriptors, &cache);

        for d in &descriptors {
            let expected = fingerprint(d, &cache);
            assert_eq!(batch.get(&d.name), Some(&expected));
        }
    }
}
