use nvhost_rs::config::HeapConfig;
use nvhost_rs::nvmap::{
    CarveoutHeap, HeapAllocator, HeapMask, NvMap, PAGE_SIZE, SystemPages, mask_to_policy,
};
use nvhost_rs::utils::FdAllocator;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("                 nvhost-rs - Heap Allocation                ");
    println!("============================================================");

    // 1. Fallback orders
    let mask = HeapMask::IOVMM | HeapMask::GENERIC;
    println!("[+] Heap policy for {mask:?}");
    println!("    1 page:   {:?}", mask_to_policy(mask, 1)?);
    println!("    16 pages: {:?}", mask_to_policy(mask, 16)?);
    match mask_to_policy(HeapMask::IVM | HeapMask::GENERIC, 1) {
        Ok(policy) => println!("    IVM|GENERIC: {policy:?}"),
        Err(e) => println!("    IVM|GENERIC rejected: {e}"),
    }

    // 2. Memory: 256 system pages and a 64 KB generic carveout
    let system = Arc::new(SystemPages::new(256));
    let heap = HeapAllocator::new(&HeapConfig::default(), system.clone());
    let nvmap = NvMap::new(heap, Arc::new(FdAllocator::new())).with_carveout(CarveoutHeap::new(
        "generic",
        HeapMask::GENERIC,
        0x9000_0000,
        16 * PAGE_SIZE as u64,
    ));

    // 3. Allocate a few handles
    println!("[+] Allocating handles...");
    let mut handles = Vec::new();
    for pages in [1usize, 40, 96] {
        let handle = nvmap.create_handle(pages * PAGE_SIZE)?;
        match nvmap.alloc_handle(&handle, mask, false) {
            Ok(()) => println!(
                "    {pages:>3} pages -> {:?} (system pages in use: {})",
                handle.heap_type(),
                system.outstanding()
            ),
            Err(e) => println!("    {pages:>3} pages -> failed: {e}"),
        }
        handles.push(handle);
    }

    let big = handles[1].size() / PAGE_SIZE;
    let stats = nvmap.stats();
    println!(
        "    Big-page allocations: {}, total pages: {}",
        stats.big_page_allocs.load(Ordering::Relaxed),
        stats.total_page_allocs.load(Ordering::Relaxed)
    );

    // 4. Exhaust system memory
    let huge = nvmap.create_handle(512 * PAGE_SIZE)?;
    if let Err(e) = nvmap.alloc_handle(&huge, HeapMask::IOVMM, false) {
        println!("[+] 512-page request failed as expected: {e}");
        println!("    System pages in use: {}", system.outstanding());
    }

    // 5. Free everything
    for handle in handles.drain(..) {
        let id = handle.id();
        drop(handle);
        nvmap.free_handle(id)?;
    }
    println!("[+] Freed handles ({big}-page handle included)");
    println!("    System pages in use: {}", system.outstanding());
    println!("============================================================");
    Ok(())
}
