use arrayvec::ArrayVec;
use byteorder::{ByteOrder, LittleEndian};
use ring::constant_time;
use std::cmp;
use std::fmt;
use std::io;

pub const HASH_SIZE: usize = 32;
pub(crate) const PARENT_SIZE: usize = 2 * HASH_SIZE;
pub(crate) const HEADER_SIZE: usize = 8;
pub const CHUNK_SIZE: usize = 1024;
pub(crate) const BLOCK_SIZE: usize = 64;
// With 1024 byte chunks, 54 levels is enough for a full 2^64 - 1 bytes of
// input. Reserving 64 keeps the stack capacity aligned with the sizes
// arrayvec implements and costs only a few hundred extra bytes.
pub(crate) const MAX_DEPTH: usize = 64;

pub type Hash = [u8; HASH_SIZE];
pub(crate) type ParentNode = [u8; PARENT_SIZE];

// The BLAKE3 initialization vector.
const IV: [u32; 8] = [
    0x6A09E667, 0xBB67AE85, 0x3C6EF372, 0xA54FF53A, 0x510E527F, 0x9B05688C, 0x1F83D9AB, 0x5BE0CD19,
];

// The BLAKE3 message schedule, one row per round.
const MSG_SCHEDULE: [[usize; 16]; 7] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [2, 6, 3, 10, 7, 0, 4, 13, 1, 11, 12, 5, 9, 14, 15, 8],
    [3, 4, 10, 12, 13, 2, 7, 14, 6, 5, 9, 0, 11, 15, 8, 1],
    [10, 7, 12, 9, 14, 3, 13, 15, 4, 0, 11, 2, 5, 8, 1, 6],
    [12, 13, 9, 11, 15, 10, 14, 8, 7, 2, 5, 3, 0, 1, 6, 4],
    [9, 14, 11, 5, 8, 12, 15, 1, 13, 3, 0, 10, 2, 6, 4, 7],
    [11, 15, 5, 0, 1, 9, 8, 6, 14, 10, 2, 12, 3, 4, 7, 13],
];

// Domain separation flags. Each compression sets the subset that describes
// its position in the tree. KEYED_HASH and DERIVE_KEY are part of the flag
// namespace but unused here; only the plain hash mode is implemented.
pub const CHUNK_START: u32 = 1 << 0;
pub const CHUNK_END: u32 = 1 << 1;
pub const PARENT: u32 = 1 << 2;
pub const ROOT: u32 = 1 << 3;
pub const KEYED_HASH: u32 = 1 << 4;
pub const DERIVE_KEY: u32 = 1 << 5;

pub(crate) fn encode_len(len: u64) -> [u8; HEADER_SIZE] {
    let mut len_bytes = [0; HEADER_SIZE];
    LittleEndian::write_u64(&mut len_bytes, len);
    len_bytes
}

pub(crate) fn decode_len(bytes: &[u8; HEADER_SIZE]) -> u64 {
    LittleEndian::read_u64(bytes)
}

// Exactly one node in the tree is finalized as the root, whether that's a
// parent node or (for inputs of one chunk or less) a single chunk. Carrying
// this down the descent as an enum, rather than a bool that callers might
// compute, keeps inner nodes from ever being promoted by accident.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Finalization {
    NotRoot,
    Root,
}
use self::Finalization::{NotRoot, Root};

impl Finalization {
    fn root_flag(self) -> u32 {
        match self {
            NotRoot => 0,
            Root => ROOT,
        }
    }
}

// The truncated BLAKE3 compression function. The state is the input
// chaining value, the first half of the IV, and the offset/length/flags
// words; seven rounds of mixing; and an output feedforward XOR that keeps
// only the first eight words.
pub(crate) fn compress(
    cv: &[u32; 8],
    block: &[u8; BLOCK_SIZE],
    block_len: u32,
    offset: u64,
    flags: u32,
) -> [u32; 8] {
    let mut block_words = [0; 16];
    LittleEndian::read_u32_into(block, &mut block_words);
    let mut state = [
        cv[0],
        cv[1],
        cv[2],
        cv[3],
        cv[4],
        cv[5],
        cv[6],
        cv[7],
        IV[0],
        IV[1],
        IV[2],
        IV[3],
        offset as u32,
        (offset >> 32) as u32,
        block_len,
        flags,
    ];
    for schedule in MSG_SCHEDULE.iter() {
        round(&mut state, &block_words, schedule);
    }
    let mut output = [0; 8];
    for word_i in 0..8 {
        output[word_i] = state[word_i] ^ state[word_i + 8];
    }
    output
}

fn round(state: &mut [u32; 16], msg: &[u32; 16], schedule: &[usize; 16]) {
    // Mix the columns.
    g(state, 0, 4, 8, 12, msg[schedule[0]], msg[schedule[1]]);
    g(state, 1, 5, 9, 13, msg[schedule[2]], msg[schedule[3]]);
    g(state, 2, 6, 10, 14, msg[schedule[4]], msg[schedule[5]]);
    g(state, 3, 7, 11, 15, msg[schedule[6]], msg[schedule[7]]);
    // Mix the diagonals.
    g(state, 0, 5, 10, 15, msg[schedule[8]], msg[schedule[9]]);
    g(state, 1, 6, 11, 12, msg[schedule[10]], msg[schedule[11]]);
    g(state, 2, 7, 8, 13, msg[schedule[12]], msg[schedule[13]]);
    g(state, 3, 4, 9, 14, msg[schedule[14]], msg[schedule[15]]);
}

fn g(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize, x: u32, y: u32) {
    state[a] = state[a].wrapping_add(state[b]).wrapping_add(x);
    state[d] = (state[d] ^ state[a]).rotate_right(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_right(12);
    state[a] = state[a].wrapping_add(state[b]).wrapping_add(y);
    state[d] = (state[d] ^ state[a]).rotate_right(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_right(7);
}

fn bytes_from_cv(cv: &[u32; 8]) -> Hash {
    let mut bytes = [0; HASH_SIZE];
    LittleEndian::write_u32_into(cv, &mut bytes);
    bytes
}

// Compute the chaining value of one chunk. Every block of the chunk is
// compressed with the chunk's index in the offset words. The first block
// sets CHUNK_START and the last sets CHUNK_END, plus ROOT if this chunk is
// the entire input. The final block is zero padded, with its real length in
// the block_len word. An empty input is a single empty chunk, which takes
// the CHUNK_START|CHUNK_END path with block_len 0.
pub(crate) fn chunk_cv(chunk: &[u8], chunk_index: u64, finalization: Finalization) -> Hash {
    debug_assert!(chunk.len() <= CHUNK_SIZE);
    let mut cv = IV;
    let mut flags = CHUNK_START;
    let mut position = 0;
    while chunk.len() - position > BLOCK_SIZE {
        let block = array_ref!(chunk, position, BLOCK_SIZE);
        cv = compress(&cv, block, BLOCK_SIZE as u32, chunk_index, flags);
        flags = 0;
        position += BLOCK_SIZE;
    }
    flags |= CHUNK_END | finalization.root_flag();
    let block_len = chunk.len() - position;
    let mut last_block = [0; BLOCK_SIZE];
    last_block[..block_len].copy_from_slice(&chunk[position..]);
    cv = compress(&cv, &last_block, block_len as u32, chunk_index, flags);
    bytes_from_cv(&cv)
}

// Compute the chaining value of a parent node, the 64 byte concatenation of
// its children's chaining values. Parents always compress a full block from
// the IV, with a zero offset.
pub(crate) fn parent_cv(parent: &ParentNode, finalization: Finalization) -> Hash {
    let flags = PARENT | finalization.root_flag();
    let cv = compress(&IV, parent, BLOCK_SIZE as u32, 0, flags);
    bytes_from_cv(&cv)
}

pub(crate) fn parent_hash(left_hash: &Hash, right_hash: &Hash, finalization: Finalization) -> Hash {
    let mut node = [0; PARENT_SIZE];
    node[..HASH_SIZE].copy_from_slice(left_hash);
    node[HASH_SIZE..].copy_from_slice(right_hash);
    parent_cv(&node, finalization)
}

fn verify(expected: &Hash, found: &Hash) -> io::Result<()> {
    constant_time::verify_slices_are_equal(&expected[..], &found[..])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hash mismatch"))
}

pub(crate) fn verify_chunk(
    expected: &Hash,
    chunk: &[u8],
    chunk_index: u64,
    finalization: Finalization,
) -> io::Result<()> {
    let found = chunk_cv(chunk, chunk_index, finalization);
    verify(expected, &found)
}

pub(crate) fn verify_parent(
    expected: &Hash,
    parent: &ParentNode,
    finalization: Finalization,
) -> io::Result<()> {
    let found = parent_cv(parent, finalization);
    verify(expected, &found)
}

// Round n down to a power of two. Subtree chunk counts get split this way.
pub(crate) fn largest_power_of_two_leq(n: u64) -> u64 {
    ((n / 2) + 1).next_power_of_two()
}

// How many bytes go on the left side of a subtree longer than one chunk.
// The left side takes the biggest power-of-two chunk count that still
// leaves the right side at least one byte, so the left child is always a
// complete subtree and all the unevenness hangs off the right edge.
pub(crate) fn left_len(content_len: u64) -> u64 {
    debug_assert!(content_len > CHUNK_SIZE as u64);
    let full_chunks = (content_len - 1) / CHUNK_SIZE as u64;
    largest_power_of_two_leq(full_chunks) * CHUNK_SIZE as u64
}

pub(crate) fn count_chunks(content_len: u64) -> u64 {
    // Every input has at least one chunk, even the empty one.
    cmp::max(1, (content_len + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64)
}

// The number of encoded bytes a subtree of the given content length
// occupies, not counting the header. Outboard trees carry only the parent
// nodes.
pub(crate) fn encoded_subtree_size(content_len: u64, outboard: bool) -> u128 {
    let parents_size = (count_chunks(content_len) - 1) as u128 * PARENT_SIZE as u128;
    if outboard {
        parents_size
    } else {
        parents_size + content_len as u128
    }
}

fn hash_recurse(input: &[u8], chunk_index: u64, finalization: Finalization) -> Hash {
    if input.len() <= CHUNK_SIZE {
        return chunk_cv(input, chunk_index, finalization);
    }
    // More than one chunk: split at the power-of-two boundary left_len
    // picks and hash the two sides as non-root subtrees. The left side is a
    // whole number of chunks, so the right side's chunk indexes start just
    // past it.
    let llen = left_len(input.len() as u64);
    let (left, right) = input.split_at(llen as usize);
    let left_hash = hash_recurse(left, chunk_index, NotRoot);
    let right_hash = hash_recurse(right, chunk_index + llen / CHUNK_SIZE as u64, NotRoot);
    parent_hash(&left_hash, &right_hash, finalization)
}

/// Hash a whole buffer in one call. The result is the same root hash that
/// feeding the bytes through a `Writer` produces.
pub fn hash(input: &[u8]) -> Hash {
    hash_recurse(input, 0, Root)
}

// The stack of completed subtree hashes. No per-entry sizes are stored:
// after k whole chunks, the unmerged subtrees always cover power-of-two
// chunk counts matching the set bits of k, largest at the bottom. Taking in
// one more chunk increments that binary number, and every carry the
// increment propagates is a pair of equal-sized subtrees ready to merge. So
// the stack gets merged down to popcount(k) entries before each push, and
// position alone identifies each hash.
#[derive(Clone)]
pub(crate) struct State {
    subtrees: ArrayVec<[Hash; MAX_DEPTH]>,
    total_len: u64,
}

impl State {
    pub fn new() -> Self {
        Self {
            subtrees: ArrayVec::new(),
            total_len: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.total_len
    }

    fn merge_inner(&mut self, finalization: Finalization) {
        let right_child = self.subtrees.pop().unwrap();
        let left_child = self.subtrees.pop().unwrap();
        let parent = parent_hash(&left_child, &right_child, finalization);
        self.subtrees.push(parent);
    }

    fn needs_merge(&self) -> bool {
        let chunks = self.total_len / CHUNK_SIZE as u64;
        self.subtrees.len() > chunks.count_ones() as usize
    }

    /// Add a subtree hash to the state. For all but the final chunk, the
    /// subtree must be a single full chunk, hashed as NotRoot. Inputs of one
    /// chunk or less are the caller's responsibility to finalize as the
    /// root; the state never sees them merge.
    pub fn push_subtree(&mut self, hash: &Hash, len: usize) {
        while self.needs_merge() {
            self.merge_inner(NotRoot);
        }
        self.subtrees.push(*hash);
        self.total_len += len as u64;
    }

    /// After the final call to `push_subtree`, merge the stack down to the
    /// root. The top level merge is the one and only ROOT finalization.
    pub fn finish(&mut self) -> Hash {
        loop {
            if self.subtrees.len() == 1 {
                return self.subtrees[0];
            }
            let finalization = if self.subtrees.len() == 2 {
                Root
            } else {
                NotRoot
            };
            self.merge_inner(finalization);
        }
    }
}

/// An incremental hasher. A full chunk is buffered at a time, and a chunk's
/// chaining value only joins the subtree stack once at least one more input
/// byte has arrived, because the final chunk is finalized differently.
#[derive(Clone)]
pub struct Writer {
    chunk: [u8; CHUNK_SIZE],
    chunk_len: usize,
    chunk_index: u64,
    state: State,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            chunk: [0; CHUNK_SIZE],
            chunk_len: 0,
            chunk_index: 0,
            state: State::new(),
        }
    }

    /// Feed more input. Same as `write`, minus the `io::Result` plumbing.
    pub fn update(&mut self, mut input: &[u8]) {
        while !input.is_empty() {
            if self.chunk_len == CHUNK_SIZE {
                let chunk_hash = chunk_cv(&self.chunk, self.chunk_index, NotRoot);
                self.state.push_subtree(&chunk_hash, CHUNK_SIZE);
                self.chunk_index += 1;
                self.chunk_len = 0;
            }
            let want = CHUNK_SIZE - self.chunk_len;
            let take = cmp::min(want, input.len());
            self.chunk[self.chunk_len..self.chunk_len + take].copy_from_slice(&input[..take]);
            self.chunk_len += take;
            input = &input[take..];
        }
    }

    /// Finalize the buffered chunk and merge the stack down to the root
    /// hash. Nothing further can be written afterwards.
    pub fn finish(&mut self) -> Hash {
        let finalization = if self.state.count() == 0 {
            Root
        } else {
            NotRoot
        };
        let chunk_hash = chunk_cv(&self.chunk[..self.chunk_len], self.chunk_index, finalization);
        self.state.push_subtree(&chunk_hash, self.chunk_len);
        self.state.finish()
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Leave out the chunk buffer and the subtree hashes. The input may
        // be sensitive, and a kilobyte of hex isn't readable anyway.
        write!(
            f,
            "Writer {{ chunk_len: {}, chunk_index: {} }}",
            self.chunk_len, self.chunk_index
        )
    }
}

impl io::Write for Writer {
    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        self.update(input);
        Ok(input.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// Input lengths that hit every tree shape transition worth testing: the
// empty chunk, partial and exact compression blocks, the chunk boundary
// where the first parent node appears, balanced two and four chunk trees,
// and unbalanced trees on both sides of a power-of-two chunk count.
#[cfg(test)]
pub(crate) const TEST_LENS: &[usize] = &[
    0,
    1,
    BLOCK_SIZE - 1,
    BLOCK_SIZE,
    BLOCK_SIZE + 1,
    CHUNK_SIZE - 1,
    CHUNK_SIZE,
    CHUNK_SIZE + 1,
    2 * CHUNK_SIZE,
    2 * CHUNK_SIZE + 1,
    3 * CHUNK_SIZE,
    4 * CHUNK_SIZE,
    4 * CHUNK_SIZE + 1,
    5 * CHUNK_SIZE + 123,
    8 * CHUNK_SIZE,
    9 * CHUNK_SIZE - 1,
    16 * CHUNK_SIZE + 1,
];

// The official BLAKE3 test vectors hash this input pattern, so hashes of it
// can be checked against that table.
#[cfg(test)]
pub(crate) fn test_input(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
