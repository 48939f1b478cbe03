use clap::{Parser, ValueEnum};

use remset::{
    DedupMode, StoreBuffer, StoreBufferSettings,
    sim::{ObjectKind, SimHeap},
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Dedup {
    Lossy,
    Exact,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Slots recorded per round
    #[arg(long, default_value_t = 100_000)]
    slots: usize,

    /// Mutator rounds, each followed by a scavenge
    #[arg(long, default_value_t = 8)]
    rounds: usize,

    /// Old pointer chunks in the simulated heap
    #[arg(long, default_value_t = 8)]
    chunks: usize,

    /// Tagged fields per old object
    #[arg(long, default_value_t = 64)]
    fields: usize,

    /// Every nth young object is promoted by the next scavenge
    #[arg(long, default_value_t = 8)]
    promote_every: usize,

    #[arg(long, value_enum, default_value_t = Dedup::Lossy)]
    dedup: Dedup,

    /// Check buffer entries after every scavenge
    #[arg(long)]
    verify: bool,
}

/// Deterministic workload generator.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize
    }
}

const CHUNK_SIZE: usize = 256 * 1024;
const SEMISPACE_SIZE: usize = 16 * 1024 * 1024;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let holder_chunks = cli.chunks.max(1);
    let promote_every = cli.promote_every.max(1);
    // promoted objects are a header and one word
    let promoted = cli.rounds * cli.slots.div_ceil(promote_every);
    let promoted_bytes = promoted * 2 * remset::WORD_SIZE;
    let promotion_chunks = promoted_bytes.div_ceil(CHUNK_SIZE) + 1;
    let heap = SimHeap::new(
        CHUNK_SIZE,
        holder_chunks + promotion_chunks,
        SEMISPACE_SIZE,
    );
    let settings = StoreBufferSettings {
        chunk_size: CHUNK_SIZE,
        dedup: match cli.dedup {
            Dedup::Lossy => DedupMode::Lossy,
            Dedup::Exact => DedupMode::Exact,
        },
        verify_heap: cli.verify,
        ..Default::default()
    };
    let mut buffer = match StoreBuffer::set_up(settings) {
        Ok(buffer) => buffer,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let fields = cli.fields.max(1);
    let per_chunk = CHUNK_SIZE / ((fields + 1) * remset::WORD_SIZE);
    let mut objects = Vec::with_capacity(holder_chunks * per_chunk);
    for chunk in 1..=holder_chunks {
        for _ in 0..per_chunk {
            let object =
                heap.allocate_old_in(chunk, ObjectKind::Tagged, fields);
            objects.push(object);
        }
    }

    let mut rng = Lcg(0x5eed);
    for round in 0..cli.rounds {
        for i in 0..cli.slots {
            let object = objects[rng.next() % objects.len()];
            let slot = heap.field(object, rng.next() % fields);
            let young = heap.allocate_young();
            if i % promote_every == 0 {
                heap.promote_on_scavenge(young);
            }
            heap.write(slot, young);
            buffer.record_slot(&heap, slot);
        }

        buffer.gc_prologue();
        buffer.iterate_pointers_to_new_space(&heap, |slot| {
            heap.scavenge_slot(slot)
        });
        heap.flip();
        buffer.gc_epilogue(&heap);
        log::info!("round {round}: {} entries remembered", buffer.len());
    }

    println!("{:#?}", buffer.stats());
    println!(
        "entries: {}, committed: {} of {}",
        buffer.len(),
        buffer.committed_entries(),
        buffer.reserved_entries()
    );
    buffer.tear_down();
}
