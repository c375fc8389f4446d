use tagalloc::TagAlloc;

fn main() {
    let allocator = TagAlloc::new();

    println!("Config: {:#?}", allocator.config());

    unsafe {
        let mut live = Vec::new();
        for size in [24, 40, 100, 500, 1000] {
            let ptr = allocator.allocate(size).unwrap();
            println!("Requested {size} bytes, received {ptr:?}");
            live.push(ptr);
        }

        // This one is big enough for its own mapping.
        let large = allocator.allocate(100_000).unwrap();
        println!("Requested 100000 bytes, received {large:?}");

        println!("\nAfter allocating: {:#?}", allocator.counters());

        let grown = allocator.resize(Some(live[0]), 5000).unwrap();
        println!("\nResized the first allocation to 5000 bytes: {grown:?}");
        live[0] = grown;

        println!("Releasing everything...");
        for ptr in live {
            allocator.release(Some(ptr));
        }
        allocator.release(Some(large));
    }

    println!("\nFinal counters: {:#?}", allocator.counters());
}
