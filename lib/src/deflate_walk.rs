//! Finds the end of a raw deflate stream without producing its output.
//!
//! The walker decodes block headers and Huffman symbols, skipping literals, match lengths and
//! distances instead of copying them. It only tracks the number of bytes the stream would
//! produce, which is enough to reject distances that reach before the start of the stream.

use std::sync::OnceLock;

use crate::error::{Error, Result};

const MAX_BITS: usize = 15;
const FAST_BITS: u32 = 9;
const MAX_LIT_LEN_CODES: usize = 286;
const MAX_DIST_CODES: usize = 30;
const END_OF_BLOCK: u16 = 256;

// Order in which code length code lengths are stored in a dynamic block header
const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// The extent of a completely walked deflate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Walked {
    /// The number of input bytes up to and including the byte holding the last bit of the
    /// final block.
    pub consumed: usize,
    /// The number of bytes the stream decompresses to.
    pub decompressed: u64,
}

// Internal signal, converted to `Ok(None)` or a crate error at the module boundary
enum Stop {
    Incomplete,
    Invalid(&'static str),
}

type Step<T> = std::result::Result<T, Stop>;

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bitbuf: u64,
    bitcnt: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bitbuf: 0,
            bitcnt: 0,
        }
    }

    // Loads whole bytes until at least `n` bits are buffered or the input is exhausted
    #[inline]
    fn refill(&mut self, n: u32) {
        while self.bitcnt < n && self.pos < self.data.len() {
            self.bitbuf |= u64::from(self.data[self.pos]) << self.bitcnt;
            self.pos += 1;
            self.bitcnt += 8;
        }
    }

    #[inline]
    fn bits(&mut self, n: u32) -> Step<u32> {
        if n == 0 {
            return Ok(0);
        }
        self.refill(n);
        if self.bitcnt < n {
            return Err(Stop::Incomplete);
        }
        let value = (self.bitbuf & ((1 << n) - 1)) as u32;
        self.consume(n);

        Ok(value)
    }

    #[inline]
    fn consume(&mut self, n: u32) {
        self.bitbuf >>= n;
        self.bitcnt -= n;
    }

    // Drops the bits up to the next byte boundary
    fn align(&mut self) {
        let rem = self.bitcnt % 8;
        self.consume(rem);
    }

    // Skips `len` bytes, must only be called when aligned
    fn skip_bytes(&mut self, len: usize) -> Step<()> {
        let buffered = (self.bitcnt / 8) as usize;
        if len <= buffered {
            self.consume(len as u32 * 8);
            return Ok(());
        }

        let rest = len - buffered;
        self.bitbuf = 0;
        self.bitcnt = 0;
        if self.data.len() - self.pos < rest {
            self.pos = self.data.len();
            return Err(Stop::Incomplete);
        }
        self.pos += rest;

        Ok(())
    }

    // Input bytes used so far, not counting whole bytes still sitting in the bit buffer
    fn consumed(&self) -> usize {
        self.pos - (self.bitcnt / 8) as usize
    }
}

/// A canonical Huffman code with a lookup table for short codes.
struct Huffman {
    counts: [u16; MAX_BITS + 1],
    symbols: Vec<u16>,
    // Entries are `symbol | length << 9`, zero marks codes longer than FAST_BITS
    fast: Vec<u16>,
}

impl Huffman {
    fn new(lengths: &[u8]) -> Step<Self> {
        let mut counts = [0u16; MAX_BITS + 1];
        for &len in lengths {
            counts[len as usize] += 1;
        }
        counts[0] = 0;

        let mut left: i32 = 1;
        for &count in &counts[1..] {
            left <<= 1;
            left -= i32::from(count);
            if left < 0 {
                return Err(Stop::Invalid("over-subscribed huffman code"));
            }
        }

        let mut offsets = [0u16; MAX_BITS + 2];
        for len in 1..=MAX_BITS {
            offsets[len + 1] = offsets[len] + counts[len];
        }

        let mut symbols = vec![0u16; offsets[MAX_BITS + 1] as usize];
        let mut fast = vec![0u16; 1 << FAST_BITS];
        let mut next_code = [0u32; MAX_BITS + 1];
        let mut code = 0u32;
        for len in 1..=MAX_BITS {
            code = (code + u32::from(counts[len - 1])) << 1;
            next_code[len] = code;
        }

        for (symbol, &len) in lengths.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let len = len as usize;
            symbols[offsets[len] as usize] = symbol as u16;
            offsets[len] += 1;

            let code = next_code[len];
            next_code[len] += 1;
            if len as u32 <= FAST_BITS {
                // Deflate sends Huffman codes starting with the most significant bit
                let reversed = code.reverse_bits() >> (32 - len);
                let entry = symbol as u16 | (len as u16) << 9;
                let mut idx = reversed as usize;
                while idx < fast.len() {
                    fast[idx] = entry;
                    idx += 1 << len;
                }
            }
        }

        Ok(Self {
            counts,
            symbols,
            fast,
        })
    }

    fn decode(&self, br: &mut BitReader<'_>) -> Step<u16> {
        br.refill(FAST_BITS);
        let entry = self.fast[(br.bitbuf & ((1 << FAST_BITS) - 1)) as usize];
        if entry != 0 {
            let len = u32::from(entry >> 9);
            if len <= br.bitcnt {
                br.consume(len);
                return Ok(entry & 0x1ff);
            }
        }

        self.decode_slow(br)
    }

    // Bit by bit canonical decoding
    fn decode_slow(&self, br: &mut BitReader<'_>) -> Step<u16> {
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for len in 1..=MAX_BITS {
            code |= br.bits(1)? as i32;
            let count = i32::from(self.counts[len]);
            if code - first < count {
                return Ok(self.symbols[(index + code - first) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            code <<= 1;
        }

        Err(Stop::Invalid("invalid huffman code"))
    }
}

fn fixed_tables() -> &'static (Huffman, Huffman) {
    static FIXED: OnceLock<(Huffman, Huffman)> = OnceLock::new();
    FIXED.get_or_init(|| {
        let mut lengths = [0u8; 288];
        lengths[..144].fill(8);
        lengths[144..256].fill(9);
        lengths[256..280].fill(7);
        lengths[280..].fill(8);
        let dist = [5u8; 30];

        match (Huffman::new(&lengths), Huffman::new(&dist)) {
            (Ok(lit_len), Ok(dist)) => (lit_len, dist),
            _ => unreachable!("fixed huffman codes are complete"),
        }
    })
}

fn read_dynamic_tables(br: &mut BitReader<'_>) -> Step<(Huffman, Huffman)> {
    let hlit = br.bits(5)? as usize + 257;
    let hdist = br.bits(5)? as usize + 1;
    let hclen = br.bits(4)? as usize + 4;
    if hlit > MAX_LIT_LEN_CODES || hdist > MAX_DIST_CODES {
        return Err(Stop::Invalid("too many length or distance codes"));
    }

    let mut cl_lengths = [0u8; 19];
    for &idx in &CODE_LENGTH_ORDER[..hclen] {
        cl_lengths[idx] = br.bits(3)? as u8;
    }
    let cl_code = Huffman::new(&cl_lengths)?;

    let mut lengths = [0u8; MAX_LIT_LEN_CODES + MAX_DIST_CODES];
    let mut idx = 0;
    while idx < hlit + hdist {
        let symbol = cl_code.decode(br)?;
        let (value, repeat) = match symbol {
            0..=15 => (symbol as u8, 1),
            16 => {
                if idx == 0 {
                    return Err(Stop::Invalid("repeated length with no first length"));
                }
                (lengths[idx - 1], 3 + br.bits(2)? as usize)
            }
            17 => (0, 3 + br.bits(3)? as usize),
            18 => (0, 11 + br.bits(7)? as usize),
            _ => return Err(Stop::Invalid("invalid code length symbol")),
        };
        if idx + repeat > hlit + hdist {
            return Err(Stop::Invalid("too many code lengths"));
        }
        lengths[idx..idx + repeat].fill(value);
        idx += repeat;
    }

    if lengths[END_OF_BLOCK as usize] == 0 {
        return Err(Stop::Invalid("missing end-of-block code"));
    }

    let lit_len = Huffman::new(&lengths[..hlit])?;
    let dist = Huffman::new(&lengths[hlit..hlit + hdist])?;

    Ok((lit_len, dist))
}

fn skip_codes(
    br: &mut BitReader<'_>,
    lit_len: &Huffman,
    dist: &Huffman,
    produced: &mut u64,
) -> Step<()> {
    loop {
        let symbol = lit_len.decode(br)?;
        if symbol < END_OF_BLOCK {
            *produced += 1;
            continue;
        }
        if symbol == END_OF_BLOCK {
            return Ok(());
        }

        let idx = (symbol - 257) as usize;
        if idx >= LENGTH_BASE.len() {
            return Err(Stop::Invalid("invalid length symbol"));
        }
        let length = u64::from(LENGTH_BASE[idx]) + u64::from(br.bits(LENGTH_EXTRA[idx].into())?);

        let dsym = dist.decode(br)? as usize;
        if dsym >= DIST_BASE.len() {
            return Err(Stop::Invalid("invalid distance symbol"));
        }
        let distance = u64::from(DIST_BASE[dsym]) + u64::from(br.bits(DIST_EXTRA[dsym].into())?);
        if distance > *produced {
            return Err(Stop::Invalid("distance too far back"));
        }

        *produced += length;
    }
}

fn walk_blocks(br: &mut BitReader<'_>) -> Step<u64> {
    let mut produced = 0u64;

    loop {
        let last = br.bits(1)? == 1;
        match br.bits(2)? {
            0 => {
                br.align();
                let len = br.bits(16)?;
                let nlen = br.bits(16)?;
                if len != !nlen & 0xffff {
                    return Err(Stop::Invalid("stored block length check failed"));
                }
                br.skip_bytes(len as usize)?;
                produced += u64::from(len);
            }
            1 => {
                let (lit_len, dist) = fixed_tables();
                skip_codes(br, lit_len, dist, &mut produced)?;
            }
            2 => {
                let (lit_len, dist) = read_dynamic_tables(br)?;
                skip_codes(br, &lit_len, &dist, &mut produced)?;
            }
            _ => return Err(Stop::Invalid("reserved block type")),
        }

        if last {
            return Ok(produced);
        }
    }
}

/// Walks the raw deflate stream at the start of `data`.
///
/// Returns `Ok(None)` if `data` ends before the final block is complete.
///
/// # Errors
///
/// Fails with a malformed stream error if the deflate data is invalid.
pub(crate) fn walk(data: &[u8]) -> Result<Option<Walked>> {
    let mut br = BitReader::new(data);
    match walk_blocks(&mut br) {
        Ok(decompressed) => {
            br.align();
            Ok(Some(Walked {
                consumed: br.consumed(),
                decompressed,
            }))
        }
        Err(Stop::Incomplete) => Ok(None),
        Err(Stop::Invalid(reason)) => Err(Error::malformed(reason)),
    }
}
