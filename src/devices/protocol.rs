//! Update transport message codec.
//!
//! Transport agnostic: frames arrive over radio or a local link, already
//! delimited. All integers are little-endian.
use super::backup_header::Version;
use crate::error::Error;
use nom::{
    branch::alt,
    bytes::streaming::{tag, take},
    number::streaming::{le_u16, le_u32, le_u8},
    IResult,
};

pub const START: u8 = 0x01;
pub const CHUNK: u8 = 0x02;
pub const FINISH: u8 = 0x03;
pub const ABORT: u8 = 0x04;

pub const READY: u8 = 0x81;
pub const CHUNK_OK: u8 = 0x82;
pub const REBOOTING: u8 = 0x83;
pub const OK: u8 = 0x84;
pub const ERROR: u8 = 0xEE;

/// Largest encoded request: a chunk header followed by a full payload.
pub const MAX_REQUEST_SIZE: usize = 6 + u8::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Start { size: u32, crc: u32, version: Version },
    Chunk { index: u16, offset_check: u16, payload: &'a [u8] },
    Finish,
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum Response {
    Ready,
    /// Percentage of distinct chunks received so far.
    ChunkOk(u8),
    Rebooting,
    Ok,
    /// Carries an [`Error::code`].
    Error(u8),
}

pub fn parse_request(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    alt((parse_start, parse_chunk, parse_finish, parse_abort))(input)
}

fn parse_start(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    let (input, _) = tag(&[START][..])(input)?;
    let (input, size) = le_u32(input)?;
    let (input, crc) = le_u32(input)?;
    let (input, major) = le_u8(input)?;
    let (input, minor) = le_u8(input)?;
    let (input, patch) = le_u8(input)?;
    Ok((input, Request::Start { size, crc, version: Version::new(major, minor, patch) }))
}

fn parse_chunk(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    let (input, _) = tag(&[CHUNK][..])(input)?;
    let (input, index) = le_u16(input)?;
    let (input, offset_check) = le_u16(input)?;
    let (input, length) = le_u8(input)?;
    let (input, payload) = take(length as usize)(input)?;
    Ok((input, Request::Chunk { index, offset_check, payload }))
}

fn parse_finish(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    Ok((tag(&[FINISH][..])(input)?.0, Request::Finish))
}

fn parse_abort(input: &[u8]) -> IResult<&[u8], Request<'_>> {
    Ok((tag(&[ABORT][..])(input)?.0, Request::Abort))
}

impl<'a> Request<'a> {
    /// Decodes exactly one complete frame.
    pub fn decode(frame: &'a [u8]) -> Result<Self, Error> {
        match parse_request(frame) {
            Ok((rest, request)) if rest.is_empty() => Ok(request),
            _ => Err(Error::Malformed),
        }
    }

    /// Encodes into `out`, returning the frame length.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, Error> {
        let length = match self {
            Request::Start { .. } => 12,
            Request::Chunk { payload, .. } if payload.len() > u8::MAX as usize => {
                return Err(Error::TooLarge)
            }
            Request::Chunk { payload, .. } => 6 + payload.len(),
            Request::Finish | Request::Abort => 1,
        };
        let out = out.get_mut(..length).ok_or(Error::TooLarge)?;
        match self {
            Request::Start { size, crc, version } => {
                out[0] = START;
                out[1..5].copy_from_slice(&size.to_le_bytes());
                out[5..9].copy_from_slice(&crc.to_le_bytes());
                out[9..12].copy_from_slice(&version.to_bytes());
            }
            Request::Chunk { index, offset_check, payload } => {
                out[0] = CHUNK;
                out[1..3].copy_from_slice(&index.to_le_bytes());
                out[3..5].copy_from_slice(&offset_check.to_le_bytes());
                out[5] = payload.len() as u8;
                out[6..].copy_from_slice(payload);
            }
            Request::Finish => out[0] = FINISH,
            Request::Abort => out[0] = ABORT,
        }
        Ok(length)
    }
}

impl Response {
    pub fn for_error(error: Error) -> Self { Response::Error(error.code()) }

    /// Encodes into a two byte buffer, returning the used length.
    pub fn encode(&self) -> ([u8; 2], usize) {
        match *self {
            Response::Ready => ([READY, 0], 1),
            Response::ChunkOk(percent) => ([CHUNK_OK, percent], 2),
            Response::Rebooting => ([REBOOTING, 0], 1),
            Response::Ok => ([OK, 0], 1),
            Response::Error(code) => ([ERROR, code], 2),
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        match frame {
            [READY] => Ok(Response::Ready),
            [CHUNK_OK, percent] => Ok(Response::ChunkOk(*percent)),
            [REBOOTING] => Ok(Response::Rebooting),
            [OK] => Ok(Response::Ok),
            [ERROR, code] => Ok(Response::Error(*code)),
            _ => Err(Error::Malformed),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parsing_control_messages() {
        assert_eq!(Request::decode(&[FINISH]), Ok(Request::Finish));
        assert_eq!(Request::decode(&[ABORT]), Ok(Request::Abort));
        assert_eq!(Request::decode(&[0x7F]), Err(Error::Malformed));
        assert_eq!(Request::decode(&[]), Err(Error::Malformed));
    }

    #[test]
    fn parsing_a_start_message() {
        // Given
        let frame = [START, 0x10, 0x27, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE, 2, 1, 0];

        // When
        let request = Request::decode(&frame).unwrap();

        // Then
        assert_eq!(
            request,
            Request::Start { size: 10_000, crc: 0xDEAD_BEEF, version: Version::new(2, 1, 0) }
        );
    }

    #[test]
    fn parsing_a_chunk_message() {
        // Given
        let mut frame = [0u8; 6 + 128];
        frame[..6].copy_from_slice(&[CHUNK, 0x03, 0x00, 0x80, 0x01, 128]);
        frame[6..].iter_mut().for_each(|b| *b = 0x5A);

        // When
        let request = Request::decode(&frame).unwrap();

        // Then
        assert_eq!(request, Request::Chunk { index: 3, offset_check: 0x0180, payload: &[0x5A; 128] });
    }

    #[test]
    fn truncated_frames_are_incomplete() {
        let frame = [CHUNK, 0x03, 0x00, 0x80, 0x01, 128, 0x5A];
        assert!(parse_request(&frame).unwrap_err().is_incomplete());
        assert_eq!(Request::decode(&frame), Err(Error::Malformed));
    }

    #[test]
    fn trailing_bytes_are_rejected_but_streams_parse_in_sequence() {
        let frames = [FINISH, ABORT];
        assert_eq!(Request::decode(&frames), Err(Error::Malformed));

        let (rest, first) = parse_request(&frames).unwrap();
        let (rest, second) = parse_request(rest).unwrap();
        assert_eq!((first, second), (Request::Finish, Request::Abort));
        assert!(rest.is_empty());
    }

    #[test]
    fn encoded_requests_decode_to_themselves() {
        let payload = [9u8; 44];
        let requests = [
            Request::Start { size: 1, crc: 2, version: Version::new(3, 4, 5) },
            Request::Chunk { index: 513, offset_check: 0x0080, payload: &payload },
            Request::Finish,
            Request::Abort,
        ];
        let mut buffer = [0u8; MAX_REQUEST_SIZE];
        for request in requests.iter() {
            let length = request.encode(&mut buffer).unwrap();
            assert_eq!(Request::decode(&buffer[..length]), Ok(*request));
        }
        assert_eq!(Request::Finish.encode(&mut []), Err(Error::TooLarge));
    }

    #[test]
    fn response_encoding() {
        assert_eq!(Response::Ready.encode(), ([0x81, 0], 1));
        assert_eq!(Response::ChunkOk(42).encode(), ([0x82, 42], 2));
        assert_eq!(Response::for_error(Error::TooLarge).encode(), ([0xEE, 0x04], 2));
        assert_eq!(Response::decode(&[0x83]), Ok(Response::Rebooting));
        assert_eq!(Response::decode(&[0x84, 0x00]), Err(Error::Malformed));
    }
}
