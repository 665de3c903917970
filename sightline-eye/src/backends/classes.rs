//! Class name tables for closed-vocabulary models

/// COCO class names (80 classes), in YOLO output order.
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Map each vocabulary entry to its model output index, if the model knows it.
pub fn map_vocabulary<'a, I>(model_classes: &[String], vocabulary: I) -> Vec<Option<usize>>
where
    I: IntoIterator<Item = &'a str>,
{
    vocabulary
        .into_iter()
        .map(|label| model_classes.iter().position(|c| c.eq_ignore_ascii_case(label)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_table() {
        assert_eq!(COCO_CLASSES.len(), 80);
        assert_eq!(COCO_CLASSES[0], "person");
        assert_eq!(COCO_CLASSES[79], "toothbrush");
    }

    #[test]
    fn test_map_vocabulary() {
        let model: Vec<String> = COCO_CLASSES.iter().map(|c| c.to_string()).collect();
        let mapped = map_vocabulary(&model, ["Cup", "keys", "person"]);
        assert_eq!(mapped, vec![Some(41), None, Some(0)]);
    }
}
