use tagalloc::TagAlloc;

// NOTE: This example doesn't work with Miri. Under Miri the allocator mocks
// its mappings with `std::alloc`, and when we *are* the global allocator
// that mock re-enters our own lock. We cannot simulate ourselves within
// ourselves.

#[global_allocator]
static ALLOCATOR: TagAlloc = TagAlloc::new();

fn main() {
    let num = Box::new(10usize);
    println!("Boxed num {num} at {:?}", &*num as *const usize);

    let mut vec: Vec<usize> = (0..*num).collect();
    vec.push(99);
    println!("Vec: {vec:?} at {:?}", vec.as_ptr());

    let handle = std::thread::spawn(|| {
        let text = "strings land on the heap too".to_string();
        println!("Second thread: {text:?} at {:?}", text.as_ptr());
    });
    handle.join().unwrap();

    // Big enough to skip the small-object regions entirely.
    let cap = 1024 * 1024;
    let mut big: Vec<u8> = Vec::with_capacity(cap);
    big.push(1);
    println!("Large allocation of {cap} bytes at {:?}", big.as_ptr());

    drop(big);
    drop(vec);

    println!("\nCounters so far: {:#?}", ALLOCATOR.counters());
}
