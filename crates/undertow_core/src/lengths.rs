pub const fn ceil_div_u32(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

pub const fn last_element_size_u32(total: u32, chunk_size: u32) -> u32 {
    let rem = total % chunk_size;
    if rem == 0 {
        return chunk_size;
    }
    rem
}

/// One block's byte range within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSpan {
    pub piece: u32,
    pub offset: u32,
    pub len: u32,
}

/// Piece/block geometry of one torrent. Blocks are fixed-size except
/// possibly the last one of a piece.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    piece_length: u32,
    block_length: u32,
}

impl Lengths {
    pub fn new(piece_length: u32, block_length: u32) -> anyhow::Result<Self> {
        if !block_length.is_power_of_two() {
            anyhow::bail!("block length {} is not a power of 2", block_length);
        }
        if block_length > piece_length {
            anyhow::bail!(
                "block length {} is larger than piece length {}",
                block_length,
                piece_length
            );
        }
        Ok(Self {
            piece_length,
            block_length,
        })
    }

    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }

    pub const fn default_block_length(&self) -> u32 {
        self.block_length
    }

    pub const fn blocks_per_piece(&self, piece_len: u32) -> u32 {
        ceil_div_u32(piece_len, self.block_length)
    }

    pub fn iter_block_spans(&self, piece: u32, piece_len: u32) -> impl Iterator<Item = BlockSpan> {
        split_piece(piece, piece_len, self.block_length)
    }
}

/// Partition one piece into block spans of `block_len` with a short tail.
pub fn split_piece(piece: u32, piece_len: u32, block_len: u32) -> impl Iterator<Item = BlockSpan> {
    assert!(block_len > 0);
    let count = ceil_div_u32(piece_len, block_len);
    (0..count).map(move |i| {
        let offset = i * block_len;
        let len = if i + 1 == count {
            last_element_size_u32(piece_len, block_len)
        } else {
            block_len
        };
        BlockSpan { piece, offset, len }
    })
}

#[cfg(test)]
mod tests {
    use super::{BlockSpan, Lengths, split_piece};

    #[test]
    fn test_split_piece_with_tail() {
        let spans: Vec<BlockSpan> = split_piece(7, 5000, 2048).collect();
        assert_eq!(
            spans,
            vec![
                BlockSpan {
                    piece: 7,
                    offset: 0,
                    len: 2048
                },
                BlockSpan {
                    piece: 7,
                    offset: 2048,
                    len: 2048
                },
                BlockSpan {
                    piece: 7,
                    offset: 4096,
                    len: 904
                },
            ]
        );
    }

    #[test]
    fn test_split_piece_exact_multiple() {
        let spans: Vec<BlockSpan> = split_piece(0, 4096, 2048).collect();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].len, 2048);
    }

    #[test]
    fn test_lengths_validation() {
        assert!(Lengths::new(1 << 18, 1000).is_err());
        assert!(Lengths::new(1 << 10, 1 << 14).is_err());
        let l = Lengths::new(1 << 18, 1 << 14).unwrap();
        assert_eq!(l.blocks_per_piece(1 << 18), 16);
        assert_eq!(l.blocks_per_piece((1 << 14) + 1), 2);
    }
}
