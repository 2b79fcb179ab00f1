// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// tests/pipeline.rs - 检测流程集成测试
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc,
  },
  thread,
  time::Duration,
};

use image::{Rgb, RgbImage};
use kengwa::{
  alert::{AlertContext, AlertDispatcher, AlertError, AlertMessage, MailChannel},
  frame::Frame,
  gps::GpsExtractor,
  input::{InputError, InputSource, InputSourceType},
  location::LocationService,
  model::{DetectItem, DetectResult, Model, ModelError},
  output::{OutputError, OutputWriter, draw::Annotator},
  task::{ControlCommand, DetectorConfig, PipelineError, PotholeDetector},
};

const SIZE: u32 = 16;

/// 左上角像素为纯红时报告一个坑洼
struct MarkerModel {
  names: Vec<String>,
  delay: Duration,
}

impl MarkerModel {
  fn new(delay: Duration) -> Self {
    Self {
      names: vec!["pothole".to_string()],
      delay,
    }
  }
}

impl Model for MarkerModel {
  fn infer(&self, image: &RgbImage) -> Result<DetectResult, ModelError> {
    thread::sleep(self.delay);
    if image.get_pixel(0, 0)[0] == 255 {
      Ok(DetectResult::from(vec![DetectItem {
        class_id: 0,
        class_name: "pothole".to_string(),
        score: 0.9,
        bbox: [2.0, 2.0, 10.0, 10.0],
      }]))
    } else {
      Ok(DetectResult::empty())
    }
  }

  fn class_names(&self) -> &[String] {
    &self.names
  }

  fn device(&self) -> &str {
    "stub"
  }
}

fn plain() -> RgbImage {
  RgbImage::from_pixel(SIZE, SIZE, Rgb([40, 40, 40]))
}

fn marked() -> RgbImage {
  let mut image = plain();
  image.put_pixel(0, 0, Rgb([255, 0, 0]));
  image
}

/// 按固定间隔产生帧的内存视频
struct FakeVideo {
  frames: std::vec::IntoIter<RgbImage>,
  total: u64,
  pace: Duration,
  index: u64,
}

impl FakeVideo {
  fn new(frames: Vec<RgbImage>, pace: Duration) -> Self {
    let total = frames.len() as u64;
    Self {
      frames: frames.into_iter(),
      total,
      pace,
      index: 0,
    }
  }

  /// 第 `pothole_at` 帧（从 1 开始）带标记
  fn with_pothole_at(count: usize, pothole_at: usize, pace: Duration) -> Self {
    let frames = (1..=count)
      .map(|n| if n == pothole_at { marked() } else { plain() })
      .collect();
    Self::new(frames, pace)
  }
}

impl Iterator for FakeVideo {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let image = self.frames.next()?;
    thread::sleep(self.pace);
    self.index += 1;
    Some(Ok(Frame::new(image, self.index, self.index * 40)))
  }
}

impl InputSource for FakeVideo {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Video
  }

  fn width(&self) -> u32 {
    SIZE
  }

  fn height(&self) -> u32 {
    SIZE
  }

  fn fps(&self) -> Option<f64> {
    Some(25.0)
  }

  fn frame_count(&self) -> Option<u64> {
    Some(self.total)
  }
}

#[derive(Default)]
struct CollectingSink {
  frames: Vec<RgbImage>,
  finished: bool,
}

impl OutputWriter for CollectingSink {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.finished {
      return Err(OutputError::Closed);
    }
    self.frames.push(image.clone());
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.finished = true;
    Ok(())
  }
}

struct CountingChannel(Arc<AtomicUsize>);

impl MailChannel for CountingChannel {
  fn send_message(&self, message: &AlertMessage) -> Result<String, AlertError> {
    assert!(message.subject.contains("Pothole Detected"));
    let n = self.0.fetch_add(1, Ordering::SeqCst);
    Ok(format!("msg-{}", n))
  }
}

fn alerts(counter: &Arc<AtomicUsize>) -> AlertContext {
  AlertContext::new(
    AlertDispatcher::new(CountingChannel(counter.clone())),
    "sender@example.com",
    vec!["ops@example.com".to_string()],
  )
  .with_gps(GpsExtractor::new())
  .with_location(LocationService::offline())
}

fn detector(delay: Duration) -> PotholeDetector {
  PotholeDetector::new(Arc::new(MarkerModel::new(delay)), DetectorConfig::default())
    .with_annotator(Annotator::with_font(None))
}

#[test]
fn pothole_in_video_sends_one_alert() {
  let dir = tempfile::tempdir().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  let detector = detector(Duration::ZERO).with_alerts(alerts(&counter));

  let mut source = FakeVideo::with_pothole_at(10, 5, Duration::from_millis(40));
  let mut sink = CollectingSink::default();
  let result = detector
    .process_video_source(
      &mut source,
      &mut sink,
      &dir.path().join("road.mp4"),
      &dir.path().join("road_out.mp4"),
      0,
    )
    .unwrap();

  assert!(result.pothole_detected);
  assert_eq!(result.alert_sent, Some(true));
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  assert_eq!(result.video_duration, Some(10.0 / 25.0));

  let stats = result.stats.unwrap();
  assert_eq!(stats.frames_read, 10);
  assert_eq!(stats.frames_sampled, 10);
  assert_eq!(stats.frames_submitted + stats.frames_dropped_busy, 10);
  assert_eq!(stats.frames_written as usize, sink.frames.len());
  assert!(sink.finished);
}

#[test]
fn clean_video_sends_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  let detector = detector(Duration::ZERO).with_alerts(alerts(&counter));

  let mut source = FakeVideo::with_pothole_at(6, 0, Duration::from_millis(5));
  let mut sink = CollectingSink::default();
  let result = detector
    .process_video_source(
      &mut source,
      &mut sink,
      &dir.path().join("a.mp4"),
      &dir.path().join("b.mp4"),
      0,
    )
    .unwrap();

  assert!(!result.pothole_detected);
  assert_eq!(result.alert_sent, None);
  assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn frame_skip_samples_every_third_frame() {
  let mut source = FakeVideo::with_pothole_at(9, 0, Duration::from_millis(20));
  let mut sink = CollectingSink::default();
  let result = detector(Duration::ZERO)
    .process_video_source(&mut source, &mut sink, Path::new("in"), Path::new("out"), 2)
    .unwrap();

  let stats = result.stats.unwrap();
  assert_eq!(stats.frames_read, 9);
  assert_eq!(stats.frames_sampled, 3);
  assert_eq!(stats.frames_submitted + stats.frames_dropped_busy, 3);
}

#[test]
fn draining_writes_every_result_from_a_slow_model() {
  let mut source = FakeVideo::with_pothole_at(12, 0, Duration::ZERO);
  let mut sink = CollectingSink::default();
  let result = detector(Duration::from_millis(30))
    .process_video_source(&mut source, &mut sink, Path::new("in"), Path::new("out"), 0)
    .unwrap();

  let stats = result.stats.unwrap();
  assert_eq!(stats.frames_submitted + stats.frames_dropped_busy, 12);
  assert!(stats.frames_dropped_busy > 0);
  assert!(stats.frames_submitted >= 1);
  // 推理线程在超时内退出，所有完成的结果都已写出
  assert_eq!(
    stats.frames_written,
    stats.frames_inferred - stats.results_dropped
  );
  assert_eq!(sink.frames.len() as u64, stats.frames_written);
  assert!(sink.finished);
}

#[test]
fn image_with_pothole_is_annotated_and_reported() {
  let dir = tempfile::tempdir().unwrap();
  let input = dir.path().join("road.png");
  let output = dir.path().join("out").join("road_annotated.png");
  marked().save(&input).unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let result = detector(Duration::ZERO)
    .with_alerts(alerts(&counter))
    .process_image(&input, &output)
    .unwrap();

  assert!(result.pothole_detected);
  assert_eq!(result.alert_sent, Some(true));
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  assert!(output.is_file());
  assert!(result.stats.is_none());

  let annotated = image::open(&output).unwrap().to_rgb8();
  assert_ne!(annotated, marked());
}

#[test]
fn clean_image_is_written_unchanged() {
  let dir = tempfile::tempdir().unwrap();
  let input = dir.path().join("road.png");
  let output = dir.path().join("road_out.png");
  plain().save(&input).unwrap();

  let result = detector(Duration::ZERO).process_image(&input, &output).unwrap();
  assert!(!result.pothole_detected);
  assert_eq!(result.alert_sent, None);
  assert_eq!(image::open(&output).unwrap().to_rgb8(), plain());
}

#[test]
fn unreadable_image_is_a_load_error() {
  let dir = tempfile::tempdir().unwrap();
  let input = dir.path().join("broken.jpg");
  std::fs::write(&input, b"not an image").unwrap();

  let err = detector(Duration::ZERO)
    .process_image(&input, &dir.path().join("out.jpg"))
    .unwrap_err();
  assert!(matches!(err, PipelineError::Load(_)));
}

#[test]
fn webcam_session_handles_save_then_quit() {
  let dir = tempfile::tempdir().unwrap();
  let (tx, rx) = mpsc::channel();
  tx.send(ControlCommand::Save).unwrap();
  tx.send(ControlCommand::Quit).unwrap();

  let mut source = FakeVideo::with_pothole_at(20, 1, Duration::from_millis(10));
  let mut display = CollectingSink::default();
  let mut recorder = CollectingSink::default();
  let summary = detector(Duration::ZERO)
    .run_webcam_session(
      &mut source,
      Some(&mut display),
      Some(&mut recorder),
      &rx,
      0,
      dir.path(),
    )
    .unwrap();

  assert_eq!(summary.stats.frames_read, 2);
  assert_eq!(display.frames.len(), 2);
  assert_eq!(summary.snapshots.len(), 1);
  assert!(summary.snapshots[0].is_file());
  assert!(recorder.finished);
  assert_eq!(recorder.frames.len() as u64, summary.stats.frames_written);
}

#[test]
fn webcam_session_ends_when_camera_fails() {
  struct Failing(u64);

  impl Iterator for Failing {
    type Item = Result<Frame, InputError>;

    fn next(&mut self) -> Option<Self::Item> {
      self.0 += 1;
      if self.0 > 3 {
        return Some(Err(InputError::Capture("unplugged".to_string())));
      }
      Some(Ok(Frame::new(plain(), self.0, 0)))
    }
  }

  impl InputSource for Failing {
    fn source_type(&self) -> InputSourceType {
      InputSourceType::Camera
    }

    fn width(&self) -> u32 {
      SIZE
    }

    fn height(&self) -> u32 {
      SIZE
    }

    fn fps(&self) -> Option<f64> {
      None
    }
  }

  let (_tx, rx) = mpsc::channel();
  let dir = tempfile::tempdir().unwrap();
  let summary = detector(Duration::ZERO)
    .run_webcam_session(&mut Failing(0), None, None, &rx, 0, dir.path())
    .unwrap();
  assert_eq!(summary.stats.frames_read, 3);
  assert_eq!(summary.pothole_frames, 0);
}

#[test]
fn failed_snapshot_does_not_end_the_session() {
  let dir = tempfile::tempdir().unwrap();
  // 快照目录是一个普通文件，保存必然失败
  let not_a_dir = dir.path().join("snapshots");
  std::fs::write(&not_a_dir, b"").unwrap();

  let (tx, rx) = mpsc::channel();
  tx.send(ControlCommand::Save).unwrap();
  drop(tx);

  let mut source = FakeVideo::with_pothole_at(6, 0, Duration::from_millis(5));
  let mut recorder = CollectingSink::default();
  let summary = detector(Duration::ZERO)
    .run_webcam_session(&mut source, None, Some(&mut recorder), &rx, 0, &not_a_dir)
    .unwrap();

  assert_eq!(summary.stats.frames_read, 6);
  assert!(summary.snapshots.is_empty());
  assert!(recorder.finished);
  assert_eq!(recorder.frames.len() as u64, summary.stats.frames_written);
}

/// 每次写入都失败的录像端
#[derive(Default)]
struct BrokenSink {
  attempts: usize,
  finished: bool,
}

impl OutputWriter for BrokenSink {
  fn write_frame(&mut self, _: &RgbImage) -> Result<(), OutputError> {
    self.attempts += 1;
    Err(OutputError::Pipeline("disk full".to_string()))
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.finished = true;
    Ok(())
  }
}

#[test]
fn recorder_failure_still_finishes_the_recording() {
  let (_tx, rx) = mpsc::channel();
  let dir = tempfile::tempdir().unwrap();
  let mut source = FakeVideo::with_pothole_at(20, 0, Duration::from_millis(10));
  let mut recorder = BrokenSink::default();

  let err = detector(Duration::ZERO)
    .run_webcam_session(&mut source, None, Some(&mut recorder), &rx, 0, dir.path())
    .unwrap_err();

  assert!(matches!(err, PipelineError::Output(_)));
  assert_eq!(recorder.attempts, 1);
  assert!(recorder.finished);
}

#[test]
fn video_sink_failure_still_finishes_the_sink() {
  let mut source = FakeVideo::with_pothole_at(12, 0, Duration::from_millis(10));
  let mut sink = BrokenSink::default();

  let err = detector(Duration::ZERO)
    .process_video_source(&mut source, &mut sink, Path::new("in"), Path::new("out"), 0)
    .unwrap_err();

  assert!(matches!(err, PipelineError::Output(_)));
  assert_eq!(sink.attempts, 1);
  assert!(sink.finished);
}
