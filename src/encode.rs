//! Produce combined and outboard encodings. The encoder buffers the whole
//! input, hashes the tree bottom-up, and lays the output out top-down: the
//! length header, then each parent node followed by its left and right
//! subtrees, pre-order, down to the chunk bytes.

use hash;
use hash::Finalization::{self, NotRoot, Root};
use hash::{Hash, CHUNK_SIZE, HEADER_SIZE, PARENT_SIZE};

/// The total size of a combined encoding of `content_len` bytes of input.
pub fn encoded_size(content_len: u64) -> u128 {
    HEADER_SIZE as u128 + hash::encoded_subtree_size(content_len, false)
}

/// The total size of an outboard encoding, not counting the content itself.
pub fn outboard_size(content_len: u64) -> u128 {
    HEADER_SIZE as u128 + hash::encoded_subtree_size(content_len, true)
}

fn encode_recurse(
    input: &[u8],
    chunk_index: &mut u64,
    outboard: bool,
    finalization: Finalization,
) -> (Vec<u8>, Hash) {
    if input.len() <= CHUNK_SIZE {
        let chunk_hash = hash::chunk_cv(input, *chunk_index, finalization);
        *chunk_index += 1;
        let encoded = if outboard { Vec::new() } else { input.to_vec() };
        return (encoded, chunk_hash);
    }
    let llen = hash::left_len(input.len() as u64) as usize;
    // Interior nodes are never the root.
    let (left_encoded, left_hash) = encode_recurse(&input[..llen], chunk_index, outboard, NotRoot);
    let (right_encoded, right_hash) = encode_recurse(&input[llen..], chunk_index, outboard, NotRoot);
    let mut encoded = Vec::with_capacity(PARENT_SIZE + left_encoded.len() + right_encoded.len());
    encoded.extend_from_slice(&left_hash);
    encoded.extend_from_slice(&right_hash);
    encoded.extend_from_slice(&left_encoded);
    encoded.extend_from_slice(&right_encoded);
    let node_hash = hash::parent_hash(&left_hash, &right_hash, finalization);
    (encoded, node_hash)
}

fn encode_inner(input: &[u8], outboard: bool) -> (Vec<u8>, Hash) {
    // Chunk indexes are assigned left to right as the recursion visits the
    // leaves; a single counter threads through the whole walk.
    let mut chunk_index = 0;
    let (encoded, root_hash) = encode_recurse(input, &mut chunk_index, outboard, Root);
    let mut output = Vec::with_capacity(HEADER_SIZE + encoded.len());
    output.extend_from_slice(&hash::encode_len(input.len() as u64));
    output.extend_from_slice(&encoded);
    (output, root_hash)
}

/// Encode the input into a self-contained stream: the length header, then
/// parent nodes interleaved with chunk bytes. Returns the encoding and the
/// root hash.
pub fn encode(input: &[u8]) -> (Vec<u8>, Hash) {
    encode_inner(input, false)
}

/// Encode just the tree, with the chunk bytes omitted. The decoder reads the
/// content from a separate stream alongside this one.
pub fn encode_outboard(input: &[u8]) -> (Vec<u8>, Hash) {
    encode_inner(input, true)
}
