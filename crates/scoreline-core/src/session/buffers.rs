use std::{collections::BTreeMap, path::PathBuf};

use tracing::{debug, info, instrument};

use super::{Session, SessionError};
use crate::{
    model::{
        AudioSource, Buffer, BufferEvent, BufferGroup, BufferGroupId, BufferId,
        DEFAULT_CUE_FRAME_COUNT, Generate, HeaderFormat, SampleFormat,
    },
    time::Offset,
};

#[derive(Debug, Clone, Default)]
pub struct AddBufferRequest {
    pub channel_count: Option<u32>,
    pub frame_count: Option<u32>,
    /// `None` keeps the buffer allocated until the end of the session.
    pub duration: Option<f64>,
    pub starting_frame: u32,
    pub source: Option<AudioSource>,
    pub offset: Option<Offset>,
}

impl AddBufferRequest {
    #[must_use]
    pub fn frames(channel_count: u32, frame_count: u32) -> Self {
        Self {
            channel_count: Some(channel_count),
            frame_count: Some(frame_count),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_source(source: impl Into<AudioSource>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn at(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = Some(offset.into());
        self
    }
}

/// A buffer sized for streaming a soundfile, opened with a held read.
#[derive(Debug, Clone)]
pub struct CueRequest {
    pub source: AudioSource,
    pub channel_count: Option<u32>,
    pub duration: Option<f64>,
    pub frame_count: u32,
    pub starting_frame: u32,
    pub offset: Option<Offset>,
}

impl CueRequest {
    #[must_use]
    pub fn new(source: impl Into<AudioSource>) -> Self {
        Self {
            source: source.into(),
            channel_count: None,
            duration: None,
            frame_count: DEFAULT_CUE_FRAME_COUNT,
            starting_frame: 0,
            offset: None,
        }
    }

    #[must_use]
    pub fn duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn at(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = Some(offset.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub source: AudioSource,
    pub channels: Option<Vec<u32>>,
    pub frame_count: Option<u32>,
    pub starting_frame_in_buffer: u32,
    pub starting_frame_in_file: u32,
    pub leave_open: bool,
}

impl ReadRequest {
    #[must_use]
    pub fn new(source: impl Into<AudioSource>) -> Self {
        Self {
            source: source.into(),
            channels: None,
            frame_count: None,
            starting_frame_in_buffer: 0,
            starting_frame_in_file: 0,
            leave_open: false,
        }
    }

    #[must_use]
    pub fn channels(mut self, channels: Vec<u32>) -> Self {
        self.channels = Some(channels);
        self
    }

    #[must_use]
    pub fn leave_open(mut self, leave_open: bool) -> Self {
        self.leave_open = leave_open;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub path: PathBuf,
    pub header_format: HeaderFormat,
    pub sample_format: SampleFormat,
    pub frame_count: Option<u32>,
    pub starting_frame: u32,
    pub leave_open: bool,
}

impl WriteRequest {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header_format: HeaderFormat::Aiff,
            sample_format: SampleFormat::Int24,
            frame_count: None,
            starting_frame: 0,
            leave_open: false,
        }
    }

    #[must_use]
    pub fn formats(mut self, header_format: HeaderFormat, sample_format: SampleFormat) -> Self {
        self.header_format = header_format;
        self.sample_format = sample_format;
        self
    }
}

impl Session {
    #[instrument(skip(self, request), fields(session_id = %self.id))]
    pub fn add_buffer(&mut self, request: AddBufferRequest) -> Result<BufferId, SessionError> {
        self.scoped(request.offset, |session, offset| {
            session.insert_buffer(&request, None, offset)
        })
    }

    /// Adds `count` identical buffers sharing one contiguous id block.
    #[instrument(skip(self, request), fields(session_id = %self.id))]
    pub fn add_buffer_group(
        &mut self,
        count: u32,
        request: AddBufferRequest,
    ) -> Result<BufferGroupId, SessionError> {
        if count == 0 {
            return Err(SessionError::InvalidRequest(
                "a buffer group needs at least one buffer".to_string(),
            ));
        }
        self.scoped(request.offset, |session, offset| {
            let group = session.next_buffer_group_id();
            let buffers = (0..count)
                .map(|_| session.insert_buffer(&request, Some(group), offset))
                .collect::<Result<Vec<_>, _>>()?;
            session
                .buffer_groups
                .insert(group, BufferGroup { id: group, buffers });
            Ok(group)
        })
    }

    fn insert_buffer(
        &mut self,
        request: &AddBufferRequest,
        group: Option<BufferGroupId>,
        offset: Offset,
    ) -> Result<BufferId, SessionError> {
        let duration = request.duration.unwrap_or(f64::INFINITY);
        if duration.is_nan() || duration <= 0.0 {
            return Err(SessionError::InvalidDuration(duration));
        }
        if request.source.is_none() && request.frame_count.is_none() {
            return Err(SessionError::InvalidRequest(
                "a buffer needs a frame count or a source".to_string(),
            ));
        }
        if request.channel_count == Some(0) || request.frame_count == Some(0) {
            return Err(SessionError::InvalidRequest(
                "buffer dimensions must be positive".to_string(),
            ));
        }
        let id = self.next_buffer_id();
        let stop = offset + duration;
        self.state_entry(offset).start_buffers.insert(id);
        self.state_entry(stop).stop_buffers.insert(id);
        self.buffers.insert(
            id,
            Buffer {
                id,
                group,
                start: offset,
                stop,
                channel_count: request.channel_count,
                frame_count: request.frame_count,
                starting_frame: request.starting_frame,
                source: request.source.clone(),
                events: BTreeMap::new(),
            },
        );
        self.buffer_intervals.insert(id, offset, stop);
        info!(buffer = %id, %offset, %stop, "buffer added");
        Ok(id)
    }

    /// Allocates a streaming buffer and records a held read of `source`.
    #[instrument(skip(self, request), fields(session_id = %self.id))]
    pub fn cue_soundfile(&mut self, request: CueRequest) -> Result<BufferId, SessionError> {
        let channel_count = match request.channel_count {
            Some(count) => count,
            None => read_channel_count(&request.source)?,
        };
        let buffer = self.add_buffer(AddBufferRequest {
            channel_count: Some(channel_count),
            frame_count: Some(request.frame_count),
            duration: request.duration,
            starting_frame: 0,
            source: None,
            offset: request.offset,
        })?;
        let start = self.buffers.get(&buffer).map_or(Offset::ZERO, Buffer::start);
        let read = ReadRequest {
            starting_frame_in_file: request.starting_frame,
            leave_open: true,
            ..ReadRequest::new(request.source)
        };
        self.read_buffer(buffer, read, Some(start))?;
        Ok(buffer)
    }

    #[must_use]
    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    #[must_use]
    pub fn buffer_group(&self, id: BufferGroupId) -> Option<&BufferGroup> {
        self.buffer_groups.get(&id)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.values()
    }

    pub fn buffer_groups(&self) -> impl Iterator<Item = &BufferGroup> {
        self.buffer_groups.values()
    }

    /// Buffers allocated at `offset`.
    #[must_use]
    pub fn buffers_at(&self, offset: Offset) -> Vec<BufferId> {
        self.buffer_intervals.find_intersection(offset)
    }

    /// Records a buffer command; a later command of the same kind at the
    /// same offset replaces it.
    pub fn buffer_event(
        &mut self,
        buffer: BufferId,
        event: BufferEvent,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        let offset = self.resolve_offset(offset)?;
        if let BufferEvent::Copy { target, .. } = &event {
            if !self.buffers.contains_key(target) {
                return Err(SessionError::BufferNotFound(*target));
            }
        }
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or(SessionError::BufferNotFound(buffer))?;
        if !target.accepts_events_at(offset) {
            return Err(SessionError::BufferNotAlive { buffer, offset });
        }
        let kind = event.kind();
        target.events.entry(kind).or_default().set(offset, event);
        debug!(%buffer, ?kind, %offset, "buffer event recorded");
        Ok(())
    }

    pub fn read_buffer(
        &mut self,
        buffer: BufferId,
        request: ReadRequest,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        let event = BufferEvent::Read {
            source: request.source,
            channels: request.channels,
            frame_count: request.frame_count,
            starting_frame_in_buffer: request.starting_frame_in_buffer,
            starting_frame_in_file: request.starting_frame_in_file,
            leave_open: request.leave_open,
        };
        self.buffer_event(buffer, event, offset)
    }

    pub fn write_buffer(
        &mut self,
        buffer: BufferId,
        request: WriteRequest,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        let event = BufferEvent::Write {
            path: request.path,
            header_format: request.header_format,
            sample_format: request.sample_format,
            frame_count: request.frame_count,
            starting_frame: request.starting_frame,
            leave_open: request.leave_open,
        };
        self.buffer_event(buffer, event, offset)
    }

    pub fn zero_buffer(
        &mut self,
        buffer: BufferId,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        self.buffer_event(buffer, BufferEvent::Zero, offset)
    }

    /// Fills `(starting_frame, frame_count, value)` ranges.
    pub fn fill_buffer(
        &mut self,
        buffer: BufferId,
        fills: Vec<(u32, u32, f64)>,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        self.buffer_event(buffer, BufferEvent::Fill(fills), offset)
    }

    pub fn generate_buffer(
        &mut self,
        buffer: BufferId,
        generate: Generate,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        self.buffer_event(buffer, BufferEvent::Generate(generate), offset)
    }

    /// Sets individual `(index, value)` samples.
    pub fn set_buffer(
        &mut self,
        buffer: BufferId,
        values: Vec<(u32, f64)>,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        self.buffer_event(buffer, BufferEvent::Set(values), offset)
    }

    /// Sets runs of samples starting at each index.
    pub fn set_buffer_contiguous(
        &mut self,
        buffer: BufferId,
        runs: Vec<(u32, Vec<f64>)>,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        self.buffer_event(buffer, BufferEvent::SetContiguous(runs), offset)
    }

    pub fn normalize_buffer(
        &mut self,
        buffer: BufferId,
        new_maximum: f64,
        as_wavetable: bool,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        self.buffer_event(
            buffer,
            BufferEvent::Normalize {
                new_maximum,
                as_wavetable,
            },
            offset,
        )
    }

    pub fn copy_buffer(
        &mut self,
        buffer: BufferId,
        target: BufferId,
        frames: (u32, u32),
        frame_count: Option<u32>,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        let (source_starting_frame, target_starting_frame) = frames;
        self.buffer_event(
            buffer,
            BufferEvent::Copy {
                target,
                source_starting_frame,
                target_starting_frame,
                frame_count,
            },
            offset,
        )
    }

    pub fn close_buffer(
        &mut self,
        buffer: BufferId,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        self.buffer_event(buffer, BufferEvent::Close, offset)
    }
}

fn read_channel_count(source: &AudioSource) -> Result<u32, SessionError> {
    match source {
        AudioSource::File(path) => hound::WavReader::open(path)
            .map(|reader| u32::from(reader.spec().channels))
            .map_err(|error| SessionError::SoundfileHeader {
                path: path.clone(),
                reason: error.to_string(),
            }),
        AudioSource::Session(session) => Ok(session.options().output_bus_channel_count),
        AudioSource::Renderable(renderable) => Ok(renderable.channel_count()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::BufferEventKind;

    #[test]
    fn buffers_need_a_size_or_a_source() {
        let mut session = Session::default();
        assert!(matches!(
            session.add_buffer(AddBufferRequest::default().at(0.0)),
            Err(SessionError::InvalidRequest(_))
        ));
        let buffer = session
            .add_buffer(AddBufferRequest::frames(2, 512).duration(4.0).at(1.0))
            .expect("buffer should be added");
        assert_eq!(session.buffers_at(Offset::from(2.0)), vec![buffer]);
        assert!(session.buffers_at(Offset::from(5.0)).is_empty());
    }

    #[test]
    fn events_are_accepted_through_the_stop_offset() {
        let mut session = Session::default();
        let buffer = session
            .add_buffer(AddBufferRequest::frames(1, 64).duration(2.0).at(0.0))
            .expect("buffer should be added");
        session
            .write_buffer(buffer, WriteRequest::new("out.aiff"), Some(Offset::from(2.0)))
            .expect("write at stop should be accepted");
        assert!(matches!(
            session.zero_buffer(buffer, Some(Offset::from(2.5))),
            Err(SessionError::BufferNotAlive { .. })
        ));
        let written = session
            .buffer(buffer)
            .and_then(|buffer| buffer.events().get(&BufferEventKind::Write))
            .map(crate::events::EventList::len);
        assert_eq!(written, Some(1));
    }

    #[test]
    fn cueing_a_session_uses_its_output_channels() {
        let mut input = Session::default();
        input.options.output_bus_channel_count = 2;
        let input = Arc::new(input);

        let mut session = Session::default();
        let buffer = session
            .cue_soundfile(CueRequest::new(input).at(0.0))
            .expect("cue should succeed");
        let cued = session.buffer(buffer).expect("buffer should exist");
        assert_eq!(cued.channel_count(), Some(2));
        assert_eq!(cued.frame_count(), Some(DEFAULT_CUE_FRAME_COUNT));
        assert!(cued.events().contains_key(&BufferEventKind::Read));
    }

    #[test]
    fn cueing_a_missing_file_reports_the_header_failure() {
        let mut session = Session::default();
        let error = session
            .cue_soundfile(CueRequest::new(PathBuf::from("/definitely/missing.wav")).at(0.0))
            .expect_err("header read should fail");
        assert!(matches!(error, SessionError::SoundfileHeader { .. }));
    }
}
