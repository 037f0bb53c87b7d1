//! Stream verified content back out of an encoding. The decoders are
//! recursive descents over subtree intervals: parents are verified before
//! either child is read, and a chunk is only written to the output once its
//! chaining value checks out, so the caller never sees an unverified byte.
//! Buffering is bounded by one chunk plus the descent stack.

use std::cmp;
use std::io;
use std::io::prelude::*;
use std::io::SeekFrom;

use hash;
use hash::Finalization::{self, NotRoot, Root};
use hash::{Hash, ParentNode, CHUNK_SIZE, HASH_SIZE, HEADER_SIZE, PARENT_SIZE};

fn read_header<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;
    Ok(hash::decode_len(&bytes))
}

fn read_parent<R: Read>(reader: &mut R) -> io::Result<ParentNode> {
    let mut bytes = [0; PARENT_SIZE];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

struct Decoder<T: Read, O: Read, W: Write> {
    input: T,
    outboard: Option<O>,
    output: W,
    chunk_index: u64,
}

impl<T: Read, O: Read, W: Write> Decoder<T, O, W> {
    // In combined mode the parent nodes are interleaved with the chunks in
    // the input; in outboard mode they come from their own stream.
    fn read_from_tree(&mut self) -> io::Result<ParentNode> {
        match self.outboard {
            Some(ref mut outboard) => read_parent(outboard),
            None => read_parent(&mut self.input),
        }
    }

    fn read_len(&mut self) -> io::Result<u64> {
        match self.outboard {
            Some(ref mut outboard) => read_header(outboard),
            None => read_header(&mut self.input),
        }
    }

    fn subtree(
        &mut self,
        subtree_hash: &Hash,
        content_len: u64,
        finalization: Finalization,
    ) -> io::Result<()> {
        if content_len <= CHUNK_SIZE as u64 {
            let mut chunk_buf = [0; CHUNK_SIZE];
            let chunk = &mut chunk_buf[..content_len as usize];
            self.input.read_exact(chunk)?;
            hash::verify_chunk(subtree_hash, chunk, self.chunk_index, finalization)?;
            self.chunk_index += 1;
            self.output.write_all(chunk)
        } else {
            let parent = self.read_from_tree()?;
            hash::verify_parent(subtree_hash, &parent, finalization)?;
            let left_hash = *array_ref!(parent, 0, HASH_SIZE);
            let right_hash = *array_ref!(parent, HASH_SIZE, HASH_SIZE);
            let llen = hash::left_len(content_len);
            self.subtree(&left_hash, llen, NotRoot)?;
            self.subtree(&right_hash, content_len - llen, NotRoot)
        }
    }

    fn run(&mut self, root_hash: &Hash) -> io::Result<()> {
        let content_len = self.read_len()?;
        self.subtree(root_hash, content_len, Root)
    }
}

/// Decode a combined encoding against the root hash, writing the verified
/// content to the output. Any hash mismatch or truncation fails the whole
/// call, and output already written before the failure must be discarded.
pub fn decode<T: Read, W: Write>(input: T, output: W, root_hash: &Hash) -> io::Result<()> {
    let mut decoder = Decoder {
        input: input,
        outboard: None::<io::Empty>,
        output: output,
        chunk_index: 0,
    };
    decoder.run(root_hash)
}

/// Decode with the tree in a separate outboard stream, reading the raw
/// content from `input`.
pub fn decode_outboard<T: Read, O: Read, W: Write>(
    input: T,
    outboard: O,
    output: W,
    root_hash: &Hash,
) -> io::Result<()> {
    let mut decoder = Decoder {
        input: input,
        outboard: Some(outboard),
        output: output,
        chunk_index: 0,
    };
    decoder.run(root_hash)
}

struct SliceExtractor<T: Read + Seek, O: Read + Seek, W: Write> {
    input: T,
    outboard: Option<O>,
    output: W,
    slice_start: u64,
    slice_end: u64,
}

impl<T: Read + Seek, O: Read + Seek, W: Write> SliceExtractor<T, O, W> {
    fn read_from_tree(&mut self) -> io::Result<ParentNode> {
        match self.outboard {
            Some(ref mut outboard) => read_parent(outboard),
            None => read_parent(&mut self.input),
        }
    }

    // Skip a subtree that lies entirely before the slice: its parent nodes
    // in the tree stream and its chunk bytes in the content stream. In
    // combined mode both seeks land on the same stream and add up.
    fn skip_subtree(&mut self, subtree_len: u64) -> io::Result<()> {
        let parents_size = hash::encoded_subtree_size(subtree_len, true) as i64;
        match self.outboard {
            Some(ref mut outboard) => {
                outboard.seek(SeekFrom::Current(parents_size))?;
            }
            None => {
                self.input.seek(SeekFrom::Current(parents_size))?;
            }
        }
        self.input.seek(SeekFrom::Current(subtree_len as i64))?;
        Ok(())
    }

    fn subtree(&mut self, subtree_start: u64, subtree_len: u64) -> io::Result<()> {
        let subtree_end = subtree_start + subtree_len;
        if subtree_end <= self.slice_start {
            self.skip_subtree(subtree_len)
        } else if self.slice_end <= subtree_start {
            // Entirely after the slice. Everything else in the recursion is
            // also after it, so there's nothing left to read or seek past.
            Ok(())
        } else if subtree_len <= CHUNK_SIZE as u64 {
            // An intersecting chunk is always included whole; the verifier
            // needs all of it to check the chaining value.
            let mut chunk_buf = [0; CHUNK_SIZE];
            let chunk = &mut chunk_buf[..subtree_len as usize];
            self.input.read_exact(chunk)?;
            self.output.write_all(chunk)
        } else {
            let parent = self.read_from_tree()?;
            self.output.write_all(&parent)?;
            let llen = hash::left_len(subtree_len);
            self.subtree(subtree_start, llen)?;
            self.subtree(subtree_start + llen, subtree_len - llen)
        }
    }

    fn run(&mut self, slice_start: u64, slice_len: u64) -> io::Result<()> {
        let mut len_bytes = [0; HEADER_SIZE];
        match self.outboard {
            Some(ref mut outboard) => outboard.read_exact(&mut len_bytes)?,
            None => self.input.read_exact(&mut len_bytes)?,
        }
        self.output.write_all(&len_bytes)?;
        let content_len = hash::decode_len(&len_bytes);

        // A zero length slice still covers one chunk, so that the verifier
        // has something to check before it terminates. A start past the end
        // gets clamped back to the final byte for the same reason. Note that
        // the end of the range keeps the caller's start; only the coverage
        // below moves.
        let slice_len = cmp::max(1, slice_len);
        self.slice_end = slice_start.saturating_add(slice_len);
        self.slice_start = if slice_start >= content_len {
            content_len.saturating_sub(1)
        } else {
            slice_start
        };

        self.subtree(0, content_len)
    }
}

/// Extract from a combined encoding the minimal stream that can verify the
/// byte range `[slice_start, slice_start + slice_len)`: the header, the
/// parent nodes on the paths to the range's chunks, and those chunks in
/// full. No verification happens here; the extractor trusts its input.
pub fn slice<T: Read + Seek, W: Write>(
    input: T,
    output: W,
    slice_start: u64,
    slice_len: u64,
) -> io::Result<()> {
    let mut extractor: SliceExtractor<T, io::Cursor<Vec<u8>>, W> = SliceExtractor {
        input: input,
        outboard: None,
        output: output,
        slice_start: 0,
        slice_end: 0,
    };
    extractor.run(slice_start, slice_len)
}

/// Extract a slice from an outboard encoding plus its content stream. The
/// output is the same self-contained format `slice` produces; the verifier
/// doesn't care which mode a slice came from.
pub fn slice_outboard<T: Read + Seek, O: Read + Seek, W: Write>(
    input: T,
    outboard: O,
    output: W,
    slice_start: u64,
    slice_len: u64,
) -> io::Result<()> {
    let mut extractor = SliceExtractor {
        input: input,
        outboard: Some(outboard),
        output: output,
        slice_start: 0,
        slice_end: 0,
    };
    extractor.run(slice_start, slice_len)
}

struct SliceDecoder<T: Read, W: Write> {
    input: T,
    output: W,
    content_len: u64,
    slice_start: u64,
    slice_end: u64,
    skip_output: bool,
}

impl<T: Read, W: Write> SliceDecoder<T, W> {
    fn subtree(
        &mut self,
        subtree_start: u64,
        subtree_len: u64,
        subtree_hash: &Hash,
        finalization: Finalization,
    ) -> io::Result<()> {
        let subtree_end = subtree_start + subtree_len;
        // Subtrees outside the slice were never emitted by the extractor, so
        // they must be skipped without consuming any input. The content_len
        // guard keeps the empty tree on the chunk path below; its single
        // empty chunk is the only thing tying the stream to the root hash.
        if self.content_len > 0 && subtree_end <= self.slice_start {
            Ok(())
        } else if self.content_len > 0 && self.slice_end <= subtree_start {
            Ok(())
        } else if subtree_len <= CHUNK_SIZE as u64 {
            let mut chunk_buf = [0; CHUNK_SIZE];
            let chunk = &mut chunk_buf[..subtree_len as usize];
            self.input.read_exact(chunk)?;
            let chunk_index = subtree_start / CHUNK_SIZE as u64;
            hash::verify_chunk(subtree_hash, chunk, chunk_index, finalization)?;
            // Chunks at the edges of the slice are carried in full but only
            // emitted where they intersect the requested range.
            let chunk_start = cmp::min(subtree_len, self.slice_start.saturating_sub(subtree_start));
            let chunk_end = cmp::min(subtree_len, self.slice_end.saturating_sub(subtree_start));
            if !self.skip_output {
                self.output.write_all(&chunk[chunk_start as usize..chunk_end as usize])?;
            }
            Ok(())
        } else {
            let parent = read_parent(&mut self.input)?;
            hash::verify_parent(subtree_hash, &parent, finalization)?;
            let left_hash = *array_ref!(parent, 0, HASH_SIZE);
            let right_hash = *array_ref!(parent, HASH_SIZE, HASH_SIZE);
            let llen = hash::left_len(subtree_len);
            self.subtree(subtree_start, llen, &left_hash, NotRoot)?;
            self.subtree(subtree_start + llen, subtree_len - llen, &right_hash, NotRoot)
        }
    }

    fn run(&mut self, root_hash: &Hash, slice_start: u64, slice_len: u64) -> io::Result<()> {
        self.content_len = read_header(&mut self.input)?;

        // Mirror the extractor's normalization, but remember when the
        // requested range was degenerate: the covering chunk still gets
        // read and verified, and nothing is emitted.
        let slice_len = if slice_len == 0 {
            self.skip_output = true;
            1
        } else {
            slice_len
        };
        self.slice_end = slice_start.saturating_add(slice_len);
        self.slice_start = if slice_start >= self.content_len {
            self.skip_output = true;
            self.content_len.saturating_sub(1)
        } else {
            slice_start
        };

        let content_len = self.content_len;
        self.subtree(0, content_len, root_hash, Root)
    }
}

/// Decode a slice stream against the root hash, writing out the bytes of
/// the requested range. The range must be the same one the slice was
/// extracted with. The first mismatched chaining value fails the call and
/// nothing further is read.
pub fn decode_slice<T: Read, W: Write>(
    input: T,
    output: W,
    root_hash: &Hash,
    slice_start: u64,
    slice_len: u64,
) -> io::Result<()> {
    let mut decoder = SliceDecoder {
        input: input,
        output: output,
        content_len: 0,
        slice_start: 0,
        slice_end: 0,
        skip_output: false,
    };
    decoder.run(root_hash, slice_start, slice_len)
}

#[cfg(test)]
mod test {
    use super::*;
    use encode;
    use hash::{test_input, TEST_LENS};
    use std::io::Cursor;

    #[test]
    fn test_decode() {
        for &case in TEST_LENS {
            println!("case {}", case);
            let input = test_input(case);
            let (encoded, root_hash) = encode::encode(&input);
            let mut output = Vec::new();
            decode(Cursor::new(&encoded), &mut output, &root_hash).expect("decode failed");
            assert_eq!(input, output, "input and output data doesn't match");
        }
    }

    #[test]
    fn test_decode_outboard() {
        for &case in TEST_LENS {
            println!("case {}", case);
            let input = test_input(case);
            let (outboard, root_hash) = encode::encode_outboard(&input);
            let mut output = Vec::new();
            decode_outboard(
                Cursor::new(&input),
                Cursor::new(&outboard),
                &mut output,
                &root_hash,
            ).expect("decode failed");
            assert_eq!(input, output, "input and output data doesn't match");
        }
    }

    #[test]
    fn test_decode_wrong_hash() {
        for &case in &[0, 1, CHUNK_SIZE, 2 * CHUNK_SIZE + 1] {
            let input = test_input(case);
            let (encoded, mut root_hash) = encode::encode(&input);
            root_hash[0] ^= 1;
            let mut output = Vec::new();
            let err = decode(Cursor::new(&encoded), &mut output, &root_hash).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn test_decode_truncated() {
        let input = test_input(2 * CHUNK_SIZE);
        let (encoded, root_hash) = encode::encode(&input);
        for truncated_len in 0..encoded.len() {
            let mut output = Vec::new();
            let res = decode(Cursor::new(&encoded[..truncated_len]), &mut output, &root_hash);
            assert!(res.is_err(), "truncation to {} not caught", truncated_len);
        }
    }

    #[test]
    fn test_tamper_detected() {
        // Flipping any bit past the header must fail decoding. Flipping the
        // low bit of every byte covers each parent node and chunk position.
        let input = test_input(2 * CHUNK_SIZE);
        let (encoded, root_hash) = encode::encode(&input);
        for tamper_i in HEADER_SIZE..encoded.len() {
            let mut bad = encoded.clone();
            bad[tamper_i] ^= 1;
            let mut output = Vec::new();
            let res = decode(Cursor::new(&bad), &mut output, &root_hash);
            assert!(res.is_err(), "tampering at {} not caught", tamper_i);
        }
    }

    #[test]
    fn test_outboard_tamper_detected() {
        let input = test_input(4 * CHUNK_SIZE);
        let (outboard, root_hash) = encode::encode_outboard(&input);
        for tamper_i in HEADER_SIZE..outboard.len() {
            let mut bad = outboard.clone();
            bad[tamper_i] ^= 1;
            let mut output = Vec::new();
            let res = decode_outboard(
                Cursor::new(&input),
                Cursor::new(&bad),
                &mut output,
                &root_hash,
            );
            assert!(res.is_err(), "tampering at {} not caught", tamper_i);
        }
    }

    fn slice_round_trip(input: &[u8], slice_start: u64, slice_len: u64) {
        let (encoded, root_hash) = encode::encode(input);
        let (outboard, _) = encode::encode_outboard(input);

        let mut slice_stream = Vec::new();
        slice(
            Cursor::new(&encoded),
            &mut slice_stream,
            slice_start,
            slice_len,
        ).expect("slice failed");

        // The outboard extractor must produce the identical stream.
        let mut outboard_slice_stream = Vec::new();
        slice_outboard(
            Cursor::new(input),
            Cursor::new(&outboard),
            &mut outboard_slice_stream,
            slice_start,
            slice_len,
        ).expect("outboard slice failed");
        assert_eq!(slice_stream, outboard_slice_stream);

        let mut output = Vec::new();
        decode_slice(
            Cursor::new(&slice_stream),
            &mut output,
            &root_hash,
            slice_start,
            slice_len,
        ).expect("decode_slice failed");

        let expected_start = cmp::min(slice_start as usize, input.len());
        let expected_end = if slice_start >= input.len() as u64 || slice_len == 0 {
            // Degenerate ranges verify but emit nothing.
            expected_start
        } else {
            cmp::min(slice_start.saturating_add(slice_len) as usize, input.len())
        };
        assert_eq!(&input[expected_start..expected_end], &output[..]);
    }

    #[test]
    fn test_slice_round_trips() {
        for &case in TEST_LENS {
            println!("case {}", case);
            let input = test_input(case);
            let len = case as u64;
            slice_round_trip(&input, 0, len);
            slice_round_trip(&input, 0, 1);
            slice_round_trip(&input, len / 2, len - len / 2);
            slice_round_trip(&input, len / 3, len / 3);
            slice_round_trip(&input, len.saturating_sub(1), 1);
            // Ranges hanging past the end get clamped to the content.
            slice_round_trip(&input, len / 2, len);
        }
    }

    #[test]
    fn test_slice_of_three_chunks() {
        let input: Vec<u8> = (0..3 * CHUNK_SIZE).map(|i| (i & 0xff) as u8).collect();
        let (encoded, root_hash) = encode::encode(&input);
        let mut slice_stream = Vec::new();
        slice(Cursor::new(&encoded), &mut slice_stream, 1500, 100).unwrap();
        // The slice carries the header, the two parents on the path to the
        // middle chunk, and that chunk in full.
        assert_eq!(
            slice_stream.len(),
            HEADER_SIZE + 2 * PARENT_SIZE + CHUNK_SIZE
        );
        let mut output = Vec::new();
        decode_slice(Cursor::new(&slice_stream), &mut output, &root_hash, 1500, 100).unwrap();
        assert_eq!(&input[1500..1600], &output[..]);
    }

    #[test]
    fn test_slice_tamper_detected() {
        let input: Vec<u8> = (0..3 * CHUNK_SIZE).map(|i| (i & 0xff) as u8).collect();
        let (encoded, root_hash) = encode::encode(&input);
        let mut slice_stream = Vec::new();
        slice(Cursor::new(&encoded), &mut slice_stream, 1500, 100).unwrap();
        for tamper_i in 0..slice_stream.len() {
            let mut bad = slice_stream.clone();
            bad[tamper_i] ^= 1;
            let mut output = Vec::new();
            let res = decode_slice(Cursor::new(&bad), &mut output, &root_hash, 1500, 100);
            assert!(res.is_err(), "tampering at {} not caught", tamper_i);
        }
    }

    #[test]
    fn test_zero_length_slice() {
        let input = test_input(2 * CHUNK_SIZE);
        let (encoded, root_hash) = encode::encode(&input);
        let mut slice_stream = Vec::new();
        slice(Cursor::new(&encoded), &mut slice_stream, 0, 0).unwrap();
        // Still covers the first chunk, so the verifier has work to do.
        assert_eq!(slice_stream.len(), HEADER_SIZE + PARENT_SIZE + CHUNK_SIZE);
        let mut output = Vec::new();
        decode_slice(Cursor::new(&slice_stream), &mut output, &root_hash, 0, 0).unwrap();
        assert_eq!(output.len(), 0);
    }

    #[test]
    fn test_out_of_range_slice() {
        let input = test_input(2 * CHUNK_SIZE);
        let (encoded, root_hash) = encode::encode(&input);
        for &start in &[2 * CHUNK_SIZE as u64, 3 * CHUNK_SIZE as u64, u64::max_value()] {
            let mut slice_stream = Vec::new();
            slice(Cursor::new(&encoded), &mut slice_stream, start, 100).unwrap();
            // Clamped back to the final chunk.
            assert_eq!(slice_stream.len(), HEADER_SIZE + PARENT_SIZE + CHUNK_SIZE);
            let mut output = Vec::new();
            decode_slice(Cursor::new(&slice_stream), &mut output, &root_hash, start, 100).unwrap();
            assert_eq!(output.len(), 0);
        }
    }

    #[test]
    fn test_empty_input_slice() {
        let (encoded, root_hash) = encode::encode(b"");
        let mut slice_stream = Vec::new();
        slice(Cursor::new(&encoded), &mut slice_stream, 0, 10).unwrap();
        // Nothing but the header; the empty chunk has no bytes to carry.
        assert_eq!(slice_stream.len(), HEADER_SIZE);
        let mut output = Vec::new();
        decode_slice(Cursor::new(&slice_stream), &mut output, &root_hash, 0, 10).unwrap();
        assert_eq!(output.len(), 0);
        // A wrong hash still fails, even with no content.
        let mut bad_hash = root_hash;
        bad_hash[0] ^= 1;
        let mut output = Vec::new();
        let res = decode_slice(Cursor::new(&slice_stream), &mut output, &bad_hash, 0, 10);
        assert!(res.is_err());
    }

    #[test]
    fn test_decode_into_sink_error() {
        // Sink errors pass through unchanged.
        struct FailingSink;
        impl Write for FailingSink {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "nope"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let input = test_input(CHUNK_SIZE);
        let (encoded, root_hash) = encode::encode(&input);
        let err = decode(Cursor::new(&encoded), FailingSink, &root_hash).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
