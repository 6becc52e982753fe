#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{json, Value};

use pollinator_worker::message::encode_crop;
use pollinator_worker::queue::zmtp::RepSocket;

/// Loopback queue server speaking ZMTP REP.
///
/// The first `silent_connections` connections swallow requests without
/// answering. Later connections answer from the shared reply script and fall
/// back to the empty-queue status once it runs out.
pub struct FakeQueue {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeQueue {
    pub fn start(replies: Vec<Vec<u8>>) -> Self {
        Self::start_with(0, replies)
    }

    pub fn silent() -> Self {
        Self::start_with(usize::MAX, Vec::new())
    }

    pub fn start_with(silent_connections: usize, replies: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake queue");
        let port = listener.local_addr().expect("local addr").port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));

        let counter = connections.clone();
        let seen = requests.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let silent = index < silent_connections;
                let seen = seen.clone();
                let replies = replies.clone();
                std::thread::spawn(move || {
                    let Ok(mut rep) = RepSocket::accept(stream, Duration::from_secs(2)) else {
                        return;
                    };
                    loop {
                        match rep.recv(Duration::from_secs(30)) {
                            Ok(Some(request)) => {
                                seen.lock().unwrap().push(request);
                                if silent {
                                    continue;
                                }
                                let reply = replies
                                    .lock()
                                    .unwrap()
                                    .pop_front()
                                    .unwrap_or_else(|| b"0".to_vec());
                                if rep.send(&reply).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => continue,
                            Err(_) => return,
                        }
                    }
                });
            }
        });

        Self {
            port,
            connections,
            requests,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn crop(width: u32, height: u32) -> String {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 5) as u8, (y * 3) as u8, 120]));
    encode_crop(&DynamicImage::ImageRgb8(img)).expect("encode crop")
}

/// Inbound batch from `node_id` with one flower per entry of `sizes`.
pub fn batch_json(node_id: &str, timestamp: &str, sizes: &[(u32, u32)]) -> Value {
    let flowers: Vec<Value> = sizes
        .iter()
        .enumerate()
        .map(|(i, &(w, h))| {
            json!({
                "class_name": if i % 2 == 0 { "dandelion" } else { "clover" },
                "score": 0.8,
                "crop": crop(w, h),
            })
        })
        .collect();
    json!({
        "metadata": {
            "node_id": node_id,
            "capture_timestamp": timestamp,
            "num_detections": sizes.len(),
            "original_image": {"size": [4056, 3040], "capture_duration": 0.8, "source": "picamera"},
            "flower_inference": {
                "confidence_threshold": 0.3,
                "iou_threshold": 0.5,
                "margin": 20,
                "model_name": "flowers-v5n",
                "max_det": 50
            }
        },
        "detections": {"flowers": flowers}
    })
}

pub fn batch_bytes(node_id: &str, timestamp: &str, sizes: &[(u32, u32)]) -> Vec<u8> {
    serde_json::to_vec(&batch_json(node_id, timestamp, sizes)).expect("serialize batch")
}
