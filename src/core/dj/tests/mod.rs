mod merge_resolution;
